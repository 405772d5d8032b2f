use crate::manifest::JobSpec;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use tracing::debug;

/// Reorder job specs so heavy and light jobs interleave in submission order.
///
/// The input is shuffled to break manifest-order bias, sorted ascending by
/// processor footprint and then drained into buckets by alternately taking
/// the heaviest and lightest remaining spec until the next pick would push
/// the bucket past `bucket_limit`. Bucket order is shuffled again before
/// flattening. The result is a permutation of the input: nothing is dropped,
/// a single spec heavier than the limit simply forms its own bucket.
pub fn balance(mut specs: Vec<JobSpec>, bucket_limit: u64) -> Vec<JobSpec> {
    let mut rng = rand::thread_rng();

    specs.shuffle(&mut rng);
    specs.sort_by_key(JobSpec::procs);

    let mut buckets = build_buckets(specs, bucket_limit);
    buckets.shuffle(&mut rng);

    debug!(buckets = buckets.len(), "balanced job order");

    buckets.into_iter().flatten().collect()
}

/// `specs` must be sorted ascending by weight
fn build_buckets(specs: Vec<JobSpec>, bucket_limit: u64) -> Vec<Vec<JobSpec>> {
    let mut remaining: VecDeque<JobSpec> = specs.into();
    let mut buckets = Vec::new();

    while !remaining.is_empty() {
        let mut bucket: Vec<JobSpec> = Vec::new();
        let mut load = 0;
        let mut take_heavy = true;

        loop {
            let candidate = if take_heavy {
                remaining.pop_back()
            } else {
                remaining.pop_front()
            };
            let Some(spec) = candidate else { break };

            let weight = spec.procs();
            if !bucket.is_empty() && load + weight > bucket_limit {
                // next pick does not fit, return it and close the bucket
                if take_heavy {
                    remaining.push_back(spec);
                } else {
                    remaining.push_front(spec);
                }

                break;
            }

            load += weight;
            bucket.push(spec);
            take_heavy = !take_heavy;
        }

        buckets.push(bucket);
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ParamValue;
    use itertools::Itertools;

    fn spec(name: &str, nodes: i64, ppn: i64) -> JobSpec {
        JobSpec {
            name: name.to_owned(),
            case: "test".to_owned(),
            repeat: 0,
            params: [
                ("nodes".to_owned(), ParamValue::Int(nodes)),
                ("ppn".to_owned(), ParamValue::Int(ppn)),
            ]
            .into(),
        }
    }

    fn names(specs: &[JobSpec]) -> Vec<String> {
        specs.iter().map(|spec| spec.name.clone()).sorted().collect()
    }

    #[test]
    fn output_is_a_permutation() {
        let input = vec![
            spec("a", 1, 1),
            spec("b", 2, 4),
            spec("c", 4, 8),
            spec("d", 1, 2),
            spec("e", 3, 3),
        ];
        let expected = names(&input);

        let output = balance(input, 16);

        assert_eq!(names(&output), expected);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert!(balance(Vec::new(), 8).is_empty());
    }

    #[test]
    fn oversized_spec_forms_its_own_bucket() {
        let input = vec![spec("huge", 16, 8), spec("tiny", 1, 1)];
        let expected = names(&input);

        let output = balance(input, 4);

        assert_eq!(names(&output), expected);
    }

    #[test]
    fn buckets_respect_the_weight_limit() {
        let mut input = vec![
            spec("a", 1, 1),
            spec("b", 1, 2),
            spec("c", 1, 4),
            spec("d", 2, 4),
            spec("e", 2, 8),
        ];
        input.sort_by_key(JobSpec::procs);

        let buckets = build_buckets(input, 16);

        for bucket in buckets.iter() {
            assert!(!bucket.is_empty());

            let load: u64 = bucket.iter().map(JobSpec::procs).sum();
            // only a single oversized member may exceed the limit
            assert!(load <= 16 || bucket.len() == 1);
        }
    }

    #[test]
    fn buckets_mix_heavy_and_light() {
        let mut input = vec![
            spec("light", 1, 1),
            spec("mid", 1, 4),
            spec("heavy", 2, 8),
        ];
        input.sort_by_key(JobSpec::procs);

        let buckets = build_buckets(input, 32);

        // all three fit one bucket, drained heaviest first then lightest
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0][0].name, "heavy");
        assert_eq!(buckets[0][1].name, "light");
        assert_eq!(buckets[0][2].name, "mid");
    }
}
