/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::worker::StepResult;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    time::Duration,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    ResultSample,
    ThroughputSample,
    #[default]
    OtherSample,
}

/// Running statistics for a single workload step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub count: u64,
    pub average: Duration,
    pub total_time: Duration,
    pub last_time: Duration,
    pub worst_time: Duration,
    pub throughput: f64,
}

/// Cumulative completions per second since the start of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub total: f64,
    pub commands: BTreeMap<String, f64>,
}

/// A complete snapshot of a run's statistics at the moment it was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub average: Duration,
    pub total_time: Duration,
    pub total: u64,
    pub total_errors: u64,
    pub total_workers: i64,
    pub last_result: Duration,
    pub last_error: Option<String>,
    pub worst_result: Duration,
    pub ninety_fifth_percentile: Duration,
    pub wall_time: Duration,
    #[serde(rename = "type")]
    pub kind: SampleType,
    pub commands: BTreeMap<String, Command>,
    pub throughput: Throughput,
}

/// Integer division of a duration by a count, truncating to whole nanoseconds.
fn divide(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((total.as_nanos() / count as u128) as u64)
}

/// Nearest-rank percentile of an ascending slice: the value at 1-based rank
/// `ceil(percentile * n / 100)`, computed without floating point.
pub fn nearest_rank(sorted: &[Duration], percentile: u64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    sorted[rank(percentile, sorted.len() as u64) - 1]
}

fn rank(percentile: u64, n: u64) -> usize {
    ((percentile * n + 99) / 100).clamp(1, n.max(1)) as usize
}

/// Streaming nearest-rank percentile. `lower` holds the `rank` smallest values seen so far and
/// `upper` the rest, so the answer is always the top of `lower`. Each insert is `O(log n)`.
#[derive(Debug)]
pub struct Percentile {
    percentile: u64,
    lower: BinaryHeap<Duration>,
    upper: BinaryHeap<Reverse<Duration>>,
}
impl Percentile {
    pub fn new(percentile: u64) -> Self {
        Percentile {
            percentile,
            lower: BinaryHeap::new(),
            upper: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, value: Duration) {
        match self.lower.peek() {
            Some(top) if value > *top => self.upper.push(Reverse(value)),
            _ => self.lower.push(value),
        }

        let n = (self.lower.len() + self.upper.len()) as u64;
        let wanted = rank(self.percentile, n);
        while self.lower.len() > wanted {
            if let Some(top) = self.lower.pop() {
                self.upper.push(Reverse(top));
            }
        }
        while self.lower.len() < wanted {
            match self.upper.pop() {
                Some(Reverse(least)) => self.lower.push(least),
                None => break,
            }
        }
    }

    pub fn value(&self) -> Duration {
        self.lower.peek().copied().unwrap_or_default()
    }
}
impl Default for Percentile {
    fn default() -> Self {
        Percentile::new(95)
    }
}

/// Folds raw run events into successive samples. Every event produces exactly one sample that
/// reflects everything seen so far.
#[derive(Debug, Default)]
pub struct Aggregator {
    current: Sample,
    // over every successful iteration duration seen so far
    p95: Percentile,
}
impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, kind: SampleType, elapsed: Duration) -> Sample {
        self.current.kind = kind;
        self.current.wall_time = elapsed;
        self.current.clone()
    }

    pub fn on_iteration(&mut self, duration: Duration, elapsed: Duration) -> Sample {
        let sample = &mut self.current;
        sample.total += 1;
        sample.total_time += duration;
        sample.average = divide(sample.total_time, sample.total);
        sample.last_result = duration;
        sample.worst_result = sample.worst_result.max(duration);

        self.p95.insert(duration);
        self.current.ninety_fifth_percentile = self.p95.value();

        self.emit(SampleType::ResultSample, elapsed)
    }

    pub fn on_step(&mut self, step: &StepResult, elapsed: Duration) -> Sample {
        let command = self
            .current
            .commands
            .entry(step.command.clone())
            .or_default();
        command.count += 1;
        command.total_time += step.duration;
        command.average = divide(command.total_time, command.count);
        command.last_time = step.duration;
        command.worst_time = command.worst_time.max(step.duration);

        self.emit(SampleType::OtherSample, elapsed)
    }

    pub fn on_error(&mut self, message: String, elapsed: Duration) -> Sample {
        self.current.total_errors += 1;
        self.current.last_error = Some(message);
        self.emit(SampleType::OtherSample, elapsed)
    }

    pub fn on_workers(&mut self, delta: i64, elapsed: Duration) -> Sample {
        self.current.total_workers += delta;
        self.emit(SampleType::OtherSample, elapsed)
    }

    /// Recomputes cumulative throughput as completions divided by the seconds elapsed so far.
    pub fn on_tick(&mut self, elapsed: Duration) -> Sample {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let mut total = 0;
            let mut rates = BTreeMap::new();
            for (name, command) in self.current.commands.iter_mut() {
                command.throughput = command.count as f64 / secs;
                rates.insert(name.clone(), command.throughput);
                total += command.count;
            }
            self.current.throughput = Throughput {
                total: total as f64 / secs,
                commands: rates,
            };
        }
        self.emit(SampleType::ThroughputSample, elapsed)
    }

    /// The current state without any new event, used for the final flush of a run.
    pub fn snapshot(&mut self, elapsed: Duration) -> Sample {
        self.emit(SampleType::OtherSample, elapsed)
    }
}
