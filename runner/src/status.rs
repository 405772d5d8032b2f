use crate::{
    manifest::JobSpec,
    scheduler::{JobHandle, Scheduler},
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status report contained no recognizable job-state marker")]
    NoSignal,
    #[error("status report carried an unexpected job-state marker {0:?}")]
    UnknownMarker(String),
}

/// Canonical job state.
///
/// Moves forward through `Pending -> Queued -> Running -> Done`; a poll that
/// yields no usable signal parks the job in `Unknown`, which later polls may
/// still resolve. `Done` and `Unknown` are terminal for campaign accounting.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Done,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Unknown)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Mutable per-job state: the immutable spec plus everything the status
/// channels have reported so far. Created at admission, updated every poll
/// round, never deleted.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub handle: Option<JobHandle>,
    pub state: JobState,
    /// seconds; fractional once the side-channel measurement took over
    pub wall_time: Option<f64>,
    /// seconds
    pub cpu_time: Option<u64>,
    pub exit_code: Option<i32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub memory: Option<String>,
    pub virtual_memory: Option<String>,
    pub hosts: Vec<String>,
}

/// records keyed by job name, the shape the checkpoint persists
pub type RecordMap = BTreeMap<String, JobRecord>;

impl JobRecord {
    fn empty(spec: JobSpec, state: JobState) -> Self {
        Self {
            spec,
            handle: None,
            state,
            wall_time: None,
            cpu_time: None,
            exit_code: None,
            submitted_at: None,
            started_at: None,
            memory: None,
            virtual_memory: None,
            hosts: Vec::new(),
        }
    }

    /// record for a job the scheduler accepted
    pub fn admitted(spec: JobSpec, handle: JobHandle) -> Self {
        let mut record = Self::empty(spec, JobState::Queued);
        record.handle = Some(handle);
        record.submitted_at = Some(Utc::now());

        record
    }

    /// record for a job that never made it into the queue; terminal, there
    /// is no handle left to poll
    pub fn failed_submit(spec: JobSpec) -> Self {
        Self::empty(spec, JobState::Unknown)
    }
}

/// Compiled patterns for the two report dialects: `key = value` lines in the
/// live report, bare `key=value` tokens in the historical trace. Owned by the
/// reconciler instead of living in module-global statics.
struct Patterns {
    report_pair: Regex,
    trace_pair: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            report_pair: Regex::new(r"(?m)^\s*([^\s=]+) = (.*)$").unwrap(),
            trace_pair: Regex::new(r"([A-Za-z_][\w.]*)=(\S+)").unwrap(),
        }
    }
}

fn fields<'a>(pattern: &Regex, report: &'a str) -> BTreeMap<&'a str, &'a str> {
    pattern
        .captures_iter(report)
        .filter_map(|caps| match (caps.get(1), caps.get(2)) {
            (Some(key), Some(value)) => Some((key.as_str(), value.as_str().trim())),
            _ => None,
        })
        .collect()
}

/// Turns free-text scheduler reports into canonical record updates.
pub struct Reconciler {
    patterns: Patterns,
    /// where per-job side-channel result files are expected
    artifacts: PathBuf,
}

impl Reconciler {
    pub fn new(artifacts: PathBuf) -> Self {
        Self {
            patterns: Patterns::new(),
            artifacts,
        }
    }

    /// One poll for one job: query both status sources and fold whatever
    /// they produced into a fresh copy of `prior`. Never fails outward; a
    /// poll without usable signal leaves the job `Unknown` for the next
    /// round to retry.
    pub fn reconcile<S: Scheduler>(&self, scheduler: &S, prior: &JobRecord) -> JobRecord {
        let mut record = prior.clone();

        // measured times of a finished job are frozen
        if record.state == JobState::Done {
            return record;
        }

        let Some(handle) = record.handle.clone() else {
            record.state = JobState::Unknown;

            return record;
        };

        match scheduler.query_status(&handle) {
            Some(report) => {
                let fields = fields(&self.patterns.report_pair, &report);

                if let Err(error) = self.apply_primary(&fields, &mut record) {
                    debug!(job = %record.spec.name, error = %error, "live status gave no usable signal");
                    record.state = JobState::Unknown;
                }
            }
            None => record.state = JobState::Unknown,
        }

        // the trace source only supplements fields, it never decides state
        if record.state != JobState::Done {
            if let Some(report) = scheduler.query_trace(&handle) {
                let fields = fields(&self.patterns.trace_pair, &report);
                merge_trace(&fields, &mut record);
            }
        }

        record
    }

    fn apply_primary(
        &self,
        fields: &BTreeMap<&str, &str>,
        record: &mut JobRecord,
    ) -> Result<(), StatusError> {
        let marker = fields.get(KEY_JOB_STATE).copied();

        if fields.contains_key(KEY_EXIT_STATUS) || marker == Some(STATE_DONE) {
            record.state = JobState::Done;
            record.exit_code = fields
                .get(KEY_EXIT_STATUS)
                .and_then(|value| value.parse().ok());
            record.cpu_time = fields
                .get(KEY_CPUTIME)
                .and_then(|value| parse_clock(value))
                .or(record.cpu_time);

            // an out-of-band measurement beats the scheduler's coarse accounting
            let reported = fields
                .get(KEY_WALLTIME)
                .and_then(|value| parse_clock(value))
                .map(|seconds| seconds as f64);
            record.wall_time = self
                .side_channel(&record.spec.name)
                .or(reported)
                .or(record.wall_time);
        } else {
            let observed = match marker {
                Some(STATE_RUNNING) => JobState::Running,
                Some(STATE_QUEUED) => JobState::Queued,
                Some(other) => return Err(StatusError::UnknownMarker(other.to_owned())),
                None => return Err(StatusError::NoSignal),
            };

            record.state = advance(record.state, observed);
        }

        if let Some(hosts) = fields.get(KEY_EXEC_HOST) {
            record.hosts = parse_hosts(hosts);
        }

        Ok(())
    }

    /// single floating-point measurement a collaborator wrote out-of-band
    fn side_channel(&self, job: &str) -> Option<f64> {
        let path = self.artifacts.join(format!("{job}.time"));
        let text = fs::read_to_string(path).ok()?;

        text.trim().parse().ok()
    }
}

/// keep transitions moving forward; a stale queue report cannot pull a
/// running job backwards
fn advance(current: JobState, observed: JobState) -> JobState {
    if current == JobState::Running && observed == JobState::Queued {
        JobState::Running
    } else {
        observed
    }
}

fn merge_trace(fields: &BTreeMap<&str, &str>, record: &mut JobRecord) {
    if let Some(memory) = fields.get(KEY_MEM) {
        record.memory = Some((*memory).to_owned());
    }

    if let Some(virtual_memory) = fields.get(KEY_VMEM) {
        record.virtual_memory = Some((*virtual_memory).to_owned());
    }

    if record.hosts.is_empty() {
        if let Some(hosts) = fields.get(KEY_EXEC_HOST) {
            record.hosts = parse_hosts(hosts);
        }
    }

    if record.started_at.is_none() {
        record.started_at = fields
            .get(KEY_START_TIME)
            .and_then(|value| value.parse().ok())
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
    }
}

/// `HH:MM:SS` style clock value to seconds
fn parse_clock(text: &str) -> Option<u64> {
    text.split(':').try_fold(0u64, |total, part| {
        part.trim().parse::<u64>().ok().map(|value| total * 60 + value)
    })
}

/// `node1/0+node1/1+node2/0` to the distinct host names
fn parse_hosts(text: &str) -> Vec<String> {
    text.split('+')
        .filter_map(|slot| slot.split('/').next())
        .filter(|host| !host.is_empty())
        .map(str::to_owned)
        .unique()
        .collect()
}

const KEY_JOB_STATE: &str = "job_state";
const KEY_WALLTIME: &str = "resources_used.walltime";
const KEY_CPUTIME: &str = "resources_used.cput";
const KEY_EXIT_STATUS: &str = "exit_status";
const KEY_MEM: &str = "resources_used.mem";
const KEY_VMEM: &str = "resources_used.vmem";
const KEY_EXEC_HOST: &str = "exec_host";
const KEY_START_TIME: &str = "start";

const STATE_DONE: &str = "C";
const STATE_QUEUED: &str = "Q";
const STATE_RUNNING: &str = "R";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ParamValue;
    use crate::scheduler::SubmissionError;
    use std::io::Write;

    struct StubScheduler {
        status: Option<String>,
        trace: Option<String>,
    }

    impl Scheduler for StubScheduler {
        fn submit(&self, _spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
            Ok(JobHandle::new("1"))
        }

        fn query_status(&self, _handle: &JobHandle) -> Option<String> {
            self.status.clone()
        }

        fn query_trace(&self, _handle: &JobHandle) -> Option<String> {
            self.trace.clone()
        }
    }

    fn record() -> JobRecord {
        let spec = JobSpec {
            name: "strong-c00-r0".to_owned(),
            case: "strong".to_owned(),
            repeat: 0,
            params: [
                ("nodes".to_owned(), ParamValue::Int(2)),
                ("ppn".to_owned(), ParamValue::Int(4)),
            ]
            .into(),
        };

        JobRecord::admitted(spec, JobHandle::new("186314"))
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(PathBuf::from("/nonexistent"))
    }

    const DONE_REPORT: &str = "Job Id: 186314.master\n\
        \x20   job_state = C\n\
        \x20   exit_status = 0\n\
        \x20   resources_used.walltime = 00:01:30\n\
        \x20   resources_used.cput = 00:05:00\n\
        \x20   exec_host = node1/0+node1/1+node2/0\n";

    #[test]
    fn exit_status_marker_resolves_to_done() {
        let scheduler = StubScheduler {
            status: Some(DONE_REPORT.to_owned()),
            trace: None,
        };

        let updated = reconciler().reconcile(&scheduler, &record());

        assert_eq!(updated.state, JobState::Done);
        assert_eq!(updated.wall_time, Some(90.0));
        assert_eq!(updated.cpu_time, Some(300));
        assert_eq!(updated.exit_code, Some(0));
        assert_eq!(updated.hosts, vec!["node1", "node2"]);
    }

    #[test]
    fn done_times_are_frozen() {
        let scheduler = StubScheduler {
            status: Some(DONE_REPORT.to_owned()),
            trace: None,
        };
        let reconciler = reconciler();
        let done = reconciler.reconcile(&scheduler, &record());

        let later = StubScheduler {
            status: Some("    job_state = C\n    exit_status = 1\n    resources_used.walltime = 09:00:00\n".to_owned()),
            trace: None,
        };
        let updated = reconciler.reconcile(&later, &done);

        assert_eq!(updated.wall_time, Some(90.0));
        assert_eq!(updated.cpu_time, Some(300));
        assert_eq!(updated.exit_code, Some(0));
    }

    #[test]
    fn queue_markers_map_to_states() {
        let reconciler = reconciler();

        let queued = StubScheduler {
            status: Some("    job_state = Q\n".to_owned()),
            trace: None,
        };
        assert_eq!(
            reconciler.reconcile(&queued, &record()).state,
            JobState::Queued
        );

        let running = StubScheduler {
            status: Some("    job_state = R\n".to_owned()),
            trace: None,
        };
        assert_eq!(
            reconciler.reconcile(&running, &record()).state,
            JobState::Running
        );
    }

    #[test]
    fn no_signal_parks_the_job_in_unknown() {
        let reconciler = reconciler();

        let silent = StubScheduler {
            status: None,
            trace: None,
        };
        assert_eq!(
            reconciler.reconcile(&silent, &record()).state,
            JobState::Unknown
        );

        let garbled = StubScheduler {
            status: Some("qstat: Unknown Job Id 186314\n".to_owned()),
            trace: None,
        };
        assert_eq!(
            reconciler.reconcile(&garbled, &record()).state,
            JobState::Unknown
        );
    }

    #[test]
    fn unknown_recovers_on_a_later_poll() {
        let reconciler = reconciler();
        let silent = StubScheduler {
            status: None,
            trace: None,
        };
        let parked = reconciler.reconcile(&silent, &record());
        assert_eq!(parked.state, JobState::Unknown);

        let scheduler = StubScheduler {
            status: Some(DONE_REPORT.to_owned()),
            trace: None,
        };
        let recovered = reconciler.reconcile(&scheduler, &parked);

        assert_eq!(recovered.state, JobState::Done);
        assert_eq!(recovered.wall_time, Some(90.0));
    }

    #[test]
    fn stale_queue_report_cannot_regress_a_running_job() {
        let reconciler = reconciler();
        let running = StubScheduler {
            status: Some("    job_state = R\n".to_owned()),
            trace: None,
        };
        let record = reconciler.reconcile(&running, &record());

        let stale = StubScheduler {
            status: Some("    job_state = Q\n".to_owned()),
            trace: None,
        };
        assert_eq!(
            reconciler.reconcile(&stale, &record).state,
            JobState::Running
        );
    }

    #[test]
    fn trace_supplements_without_deciding_state() {
        let scheduler = StubScheduler {
            status: Some("    job_state = R\n".to_owned()),
            trace: Some(
                "10/02/2026 12:00:00  S  resources_used.mem=12452kb resources_used.vmem=39174kb \
                 exec_host=node3/0+node3/1 start=1380722600 Exit_status=0\n"
                    .to_owned(),
            ),
        };

        let updated = reconciler().reconcile(&scheduler, &record());

        // the trace's Exit_status token must not flip the state
        assert_eq!(updated.state, JobState::Running);
        assert_eq!(updated.memory.as_deref(), Some("12452kb"));
        assert_eq!(updated.virtual_memory.as_deref(), Some("39174kb"));
        assert_eq!(updated.hosts, vec!["node3"]);
        assert!(updated.started_at.is_some());
    }

    #[test]
    fn side_channel_supersedes_reported_walltime() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("strong-c00-r0.time")).unwrap();
        writeln!(file, "87.25").unwrap();

        let scheduler = StubScheduler {
            status: Some(DONE_REPORT.to_owned()),
            trace: None,
        };
        let updated = Reconciler::new(dir.path().to_path_buf()).reconcile(&scheduler, &record());

        assert_eq!(updated.wall_time, Some(87.25));
        // cpu time still comes from the scheduler
        assert_eq!(updated.cpu_time, Some(300));
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("00:01:30"), Some(90));
        assert_eq!(parse_clock("02:00:00"), Some(7200));
        assert_eq!(parse_clock("bogus"), None);
    }
}
