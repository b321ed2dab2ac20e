// Copyright 2024 The Shardplane Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Exponential smoother over a monotonically sampled total.
///
/// Carries the raw total plus a decayed estimate; `smooth_rate` is the
/// estimate's current slope. Time is passed in explicitly (seconds from
/// any fixed origin) so the smoother is deterministic and resumable:
/// `reset(value)` installs `value` as both the instantaneous and the
/// smoothed reading.
#[derive(Clone, Debug)]
pub struct Smoother {
    efolding_time: f64,
    total: f64,
    time: f64,
    estimate: f64,
}

impl Smoother {
    pub fn new(efolding_time_secs: f64) -> Self {
        debug_assert!(efolding_time_secs > 0.0);
        Smoother {
            efolding_time: efolding_time_secs,
            total: 0.0,
            time: 0.0,
            estimate: 0.0,
        }
    }

    pub fn reset(&mut self, value: f64) {
        self.total = value;
        self.time = 0.0;
        self.estimate = value;
    }

    pub fn set_total(&mut self, value: f64, now: f64) {
        self.add_delta(value - self.total, now);
    }

    pub fn add_delta(&mut self, delta: f64, now: f64) {
        self.update(now);
        self.total += delta;
    }

    /// The raw total, undecayed.
    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn smooth_total(&mut self, now: f64) -> f64 {
        self.update(now);
        self.estimate
    }

    pub fn smooth_rate(&mut self, now: f64) -> f64 {
        self.update(now);
        (self.total - self.estimate) / self.efolding_time
    }

    fn update(&mut self, now: f64) {
        let elapsed = now - self.time;
        if elapsed > 0.0 {
            self.time = now;
            self.estimate +=
                (self.total - self.estimate) * (1.0 - (-elapsed / self.efolding_time).exp());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_installs_value_everywhere() {
        let mut s = Smoother::new(10.0);
        s.reset(42.0);
        assert_eq!(s.total(), 42.0);
        assert_eq!(s.smooth_total(100.0), 42.0);
        assert_eq!(s.smooth_rate(100.0), 0.0);
    }

    #[test]
    fn steady_growth_converges_to_the_input_rate() {
        let mut s = Smoother::new(1.0);
        let mut now = 0.0;
        // grow the total by 1000 per second for 30 seconds
        for _ in 0..3000 {
            now += 0.01;
            s.add_delta(10.0, now);
        }
        let rate = s.smooth_rate(now);
        assert!((rate - 1000.0).abs() < 50.0, "rate was {rate}");
    }

    #[test]
    fn estimate_lags_total_by_one_efolding_of_rate() {
        let mut s = Smoother::new(10.0);
        let mut now = 0.0;
        for _ in 0..10_000 {
            now += 0.01;
            s.add_delta(10.0, now);
        }
        // steady state: total - estimate == rate * efolding
        let gap = s.total() - s.smooth_total(now);
        assert!((gap - 10_000.0).abs() / 10_000.0 < 0.05, "gap was {gap}");
    }
}
