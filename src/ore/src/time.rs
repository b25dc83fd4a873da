// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timing related extensions.

use std::time::Duration;

/// Extensions for [`std::time::Duration`].
pub trait DurationExt {
    /// Saturating `Duration` multiplication. Computes `self * rhs`, saturating at the numeric
    /// bounds instead of overflowing.
    ///
    /// ```
    /// use std::time::Duration;
    /// use mz_ore::time::DurationExt;
    ///
    /// let one = Duration::from_secs(1);
    /// assert_eq!(one.saturating_mul_f64(f64::INFINITY), Duration::from_secs(u64::MAX));
    ///
    /// assert_eq!(one.saturating_mul_f64(f64::NEG_INFINITY), Duration::from_secs(0));
    /// assert_eq!(one.saturating_mul_f64(f64::NAN), Duration::from_secs(0));
    /// assert_eq!(one.saturating_mul_f64(-0.0), Duration::from_secs(0));
    /// assert_eq!(one.saturating_mul_f64(0.0), Duration::from_secs(0));
    ///
    /// assert_eq!(Duration::from_millis(50).saturating_mul_f64(2.0), Duration::from_millis(100));
    /// ```
    fn saturating_mul_f64(&self, rhs: f64) -> Duration;
}

impl DurationExt for Duration {
    fn saturating_mul_f64(&self, rhs: f64) -> Duration {
        let x = self.as_secs_f64() * rhs;
        let bound = if x.is_sign_negative() || x.is_nan() || x == 0.0 {
            u64::MIN
        } else {
            u64::MAX
        };
        Duration::try_from_secs_f64(x).unwrap_or(Duration::from_secs(bound))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::DurationExt;

    const ONE: Duration = Duration::from_secs(1);

    proptest! {
        #[crate::test]
        fn proptest_saturating_mul_f64(rhs: f64) {
            // Saturating multiplication should never panic.
            let _ = ONE.saturating_mul_f64(rhs);
        }

        #[crate::test]
        fn proptest_saturating_mul_f64_monotonic(a in 0.0f64..1e6, b in 0.0f64..1e6) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(ONE.saturating_mul_f64(lo) <= ONE.saturating_mul_f64(hi));
        }
    }
}
