//! Retention policy grammar and evaluator (spec §4.1, C1).
//!
//! Grammar: `[N-]period{,period}` where each period is
//! `[keep:]frequency:duration`, and frequency/duration are `<integer><unit>`
//! with units `s,h,d,w,m,y`. Reworked from
//! `original_source/src/python/bit/retention.py`'s raster-assignment
//! algorithm into an explicit, index-walking Rust pass over a newest-first
//! sample vector.

use crate::error::InputError;

/// One `[keep:]frequency:duration` period, already converted to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub keep: u64,
    pub frequency: i64,
    pub duration: i64,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    keep_initial: u64,
    periods: Vec<Period>,
}

fn unit_seconds(unit: char) -> Option<i64> {
    Some(match unit {
        's' => 1,
        'h' => 3600,
        'd' => 86_400,
        'w' => 7 * 86_400,
        'm' => 30 * 86_400,
        'y' => 365 * 86_400,
        _ => return None,
    })
}

fn frequency_to_seconds(token: &str) -> Result<i64, InputError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(InputError::InvalidPolicy("empty frequency/duration".into()));
    }
    let unit_char = token.chars().last().unwrap();
    let seconds_per_unit = unit_seconds(unit_char)
        .ok_or_else(|| InputError::InvalidPolicy(format!("unknown unit in '{token}'")))?;
    let digits = &token[..token.len() - unit_char.len_utf8()];
    let n: i64 = digits
        .parse()
        .map_err(|_| InputError::InvalidPolicy(format!("not a number in '{token}'")))?;
    Ok(n * seconds_per_unit)
}

impl RetentionPolicy {
    pub fn parse(policy: &str) -> Result<RetentionPolicy, InputError> {
        let mut keep_initial = 0u64;
        let mut rest = policy;

        if let Some(dash) = policy.find('-') {
            let (head, tail) = policy.split_at(dash);
            if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
                keep_initial = head
                    .parse()
                    .map_err(|_| InputError::InvalidPolicy(format!("bad initial keep '{head}'")))?;
                rest = &tail[1..];
            }
        }

        let mut periods = Vec::new();
        if !rest.is_empty() {
            for period in rest.split(',') {
                let tokens: Vec<&str> = period.trim().split(':').collect();
                let (keep, frequency, duration) = match tokens.as_slice() {
                    [freq, dur] => (0, frequency_to_seconds(freq)?, frequency_to_seconds(dur)?),
                    [keep, freq, dur] => (
                        keep.parse()
                            .map_err(|_| InputError::InvalidPolicy(format!("bad keep '{keep}'")))?,
                        frequency_to_seconds(freq)?,
                        frequency_to_seconds(dur)?,
                    ),
                    _ => {
                        return Err(InputError::InvalidPolicy(format!(
                            "period '{period}' must be '[keep:]frequency:duration'"
                        )))
                    }
                };
                if duration / frequency < 1 {
                    return Err(InputError::InvalidPolicy(format!(
                        "period '{period}': duration must be >= frequency"
                    )));
                }
                if let Some(prev) = periods.last() {
                    let prev: &Period = prev;
                    if prev.frequency > frequency {
                        return Err(InputError::InvalidPolicy(
                            "frequency must not get more granular in later periods".into(),
                        ));
                    }
                }
                periods.push(Period {
                    keep,
                    frequency,
                    duration,
                });
            }
        }

        Ok(RetentionPolicy {
            keep_initial,
            periods,
        })
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn keep_initial(&self) -> u64 {
        self.keep_initial
    }

    /// Filter `samples` (any order) against `now`. Returns `(kept, dropped)`,
    /// both newest-first, partitioning the input (spec §8 property 1).
    pub fn filter<T: Clone>(&self, now: i64, samples: &[(i64, T)]) -> (Vec<(i64, T)>, Vec<(i64, T)>) {
        let mut sorted: Vec<(i64, T)> = samples.to_vec();
        sorted.sort_by(|a, b| b.0.cmp(&a.0));

        let mut kept = Vec::new();
        let mut idx = 0usize;

        while idx < sorted.len() && sorted[idx].0 > now {
            kept.push(sorted[idx].clone());
            idx += 1;
        }

        let mut remaining_keep = self.keep_initial;
        while remaining_keep > 0 && idx < sorted.len() {
            kept.push(sorted[idx].clone());
            idx += 1;
            remaining_keep -= 1;
        }

        if self.periods.is_empty() {
            let dropped = sorted[idx..].to_vec();
            return (kept, dropped);
        }

        let mut dropped = Vec::new();
        let mut to_time = now;
        let n_periods = self.periods.len();

        for (pi, period) in self.periods.iter().enumerate() {
            let in_last = pi + 1 == n_periods;
            let from_time = to_time - period.duration;

            let mut retention: Vec<(i64, T)> = Vec::new();
            while idx < sorted.len() && sorted[idx].0 > from_time {
                retention.push(sorted[idx].clone());
                idx += 1;
            }

            let keep_n = (period.keep as usize).min(retention.len());
            let unconditional: Vec<(i64, T)> = retention.drain(..keep_n).collect();
            kept.extend(unconditional);

            let num_slots = (period.duration / period.frequency).max(1);
            let num_to_remove = retention.len() as i64 - num_slots;

            if num_to_remove > 0 {
                // Bin each sample to the raster slot whose ideal timestamp is
                // the nearest one >= the sample's date.
                let mut bins: Vec<Vec<usize>> = vec![Vec::new(); num_slots as usize];
                for (i, (date, _)) in retention.iter().enumerate() {
                    let mut slot = (to_time - date) / period.frequency;
                    if slot < 0 {
                        slot = 0;
                    }
                    if slot >= num_slots {
                        slot = num_slots - 1;
                    }
                    bins[slot as usize].push(i);
                }

                let mut to_remove = num_to_remove;
                let mut removed = vec![false; retention.len()];
                for slot_idx in 0..num_slots as usize {
                    if to_remove == 0 {
                        break;
                    }
                    let members = &bins[slot_idx];
                    if members.len() < 2 {
                        continue;
                    }
                    let slot_time = to_time - slot_idx as i64 * period.frequency;
                    let mut sorted_members: Vec<usize> = members.clone();
                    sorted_members.sort_by_key(|&i| (retention[i].0 - slot_time).abs());
                    // Keep the closest (first), drop the rest.
                    for &member in sorted_members.iter().skip(1) {
                        if to_remove == 0 {
                            break;
                        }
                        removed[member] = true;
                        to_remove -= 1;
                    }
                }

                for (i, (date, payload)) in retention.into_iter().enumerate() {
                    if removed[i] {
                        dropped.push((date, payload));
                    } else {
                        kept.push((date, payload));
                    }
                }
            } else if num_to_remove < 0 && in_last {
                kept.extend(retention);
                let deficit = (-num_to_remove) as usize;
                let take = deficit.min(sorted.len() - idx);
                for sample in &sorted[idx..idx + take] {
                    kept.push(sample.clone());
                }
                idx += take;
            } else {
                kept.extend(retention);
            }

            to_time = from_time;
        }

        dropped.extend(sorted[idx..].iter().cloned());
        (kept, dropped)
    }
}
