// Copyright (c) 2023 The TCPCC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TCP sequence number arithmetic.

use std::fmt;
use std::ops;

/// A 32-bit TCP sequence number.
///
/// Sequence numbers wrap around, so all comparisons are made in modular
/// arithmetic over a signed distance, never with a plain `<`.
/// See RFC 793 Section 3.3
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct TcpSeq(pub u32);

impl TcpSeq {
    /// Return whether `self` is strictly before `other` in sequence space.
    pub fn before(self, other: TcpSeq) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Return whether `self` is strictly after `other` in sequence space.
    pub fn after(self, other: TcpSeq) -> bool {
        other.before(self)
    }

    /// Return whether `seq1 <= self <= seq2` in sequence space.
    pub fn between(self, seq1: TcpSeq, seq2: TcpSeq) -> bool {
        seq2.0.wrapping_sub(seq1.0) >= self.0.wrapping_sub(seq1.0)
    }

    /// Signed distance from `other` to `self`.
    ///
    /// Positive when `self` is after `other`.
    pub fn distance(self, other: TcpSeq) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl ops::Add<u32> for TcpSeq {
    type Output = TcpSeq;

    fn add(self, rhs: u32) -> TcpSeq {
        TcpSeq(self.0.wrapping_add(rhs))
    }
}

impl ops::AddAssign<u32> for TcpSeq {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl ops::Sub<u32> for TcpSeq {
    type Output = TcpSeq;

    fn sub(self, rhs: u32) -> TcpSeq {
        TcpSeq(self.0.wrapping_sub(rhs))
    }
}

impl ops::Sub for TcpSeq {
    type Output = u32;

    /// Unsigned distance from `rhs` to `self`. The caller must ensure
    /// `rhs` is not after `self`.
    fn sub(self, rhs: TcpSeq) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for TcpSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        let a = TcpSeq(100);
        let b = TcpSeq(200);
        assert!(a.before(b));
        assert!(b.after(a));
        assert!(!a.after(b));
        assert!(!a.before(a));
        assert!(TcpSeq(150).between(a, b));
        assert!(a.between(a, b));
        assert!(b.between(a, b));
        assert!(!TcpSeq(201).between(a, b));
    }

    #[test]
    fn wraparound() {
        let a = TcpSeq(u32::MAX - 10);
        let b = TcpSeq(10);
        assert!(a.before(b));
        assert!(b.after(a));
        assert_eq!(b - a, 21);
        assert_eq!(a + 21, b);
        assert!(TcpSeq(3).between(a, b));

        let mut c = TcpSeq(u32::MAX);
        c += 1;
        assert_eq!(c, TcpSeq(0));
        assert_eq!(c - 1, TcpSeq(u32::MAX));
    }

    #[test]
    fn distance() {
        assert_eq!(TcpSeq(200).distance(TcpSeq(100)), 100);
        assert_eq!(TcpSeq(100).distance(TcpSeq(200)), -100);
        assert_eq!(TcpSeq(5).distance(TcpSeq(u32::MAX - 4)), 10);
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", TcpSeq(42)), "42");
    }
}
