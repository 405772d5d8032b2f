use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, fs::File, path::Path};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest")]
    Io(#[from] std::io::Error),
    #[error("manifest is not well-formed")]
    Parse(#[from] serde_yaml::Error),
    #[error("case {case} references unknown template {template}")]
    UnknownTemplate { case: String, template: String },
    #[error("case {0} has neither an inline case list nor a template reference")]
    EmptyCase(String),
}

/// A single parameter value as it appears in the manifest
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
        }
    }
}

/// one partial parameter assignment from a template or inline case list
pub type Fragment = BTreeMap<String, ParamValue>;

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default = "default_repeats")]
    pub cases_repeats: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Case {
    // per-case overrides applied between fragment values and the global defaults
    #[serde(default)]
    pub default: Fragment,
    #[serde(default, alias = "casesTemplate")]
    pub cases_template: Option<String>,
    #[serde(default)]
    pub cases: Vec<Fragment>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub configuration: Configuration,
    // reusable fragment lists, referenced by cases via `casesTemplate`
    #[serde(default)]
    pub templates: BTreeMap<String, Vec<Fragment>>,
    // the global defaults also define the recognized parameter set
    pub default: Fragment,
    pub cases: BTreeMap<String, Case>,
}

/// Immutable, fully resolved configuration for one experiment instance.
/// The balancer may move it around in submission order but never edits it.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub case: String,
    pub repeat: u32,
    pub params: Fragment,
}

impl JobSpec {
    pub fn nodes(&self) -> u64 {
        self.params.get("nodes").and_then(ParamValue::as_u64).unwrap_or(1)
    }

    pub fn ppn(&self) -> u64 {
        self.params.get("ppn").and_then(ParamValue::as_u64).unwrap_or(1)
    }

    /// total processor slots, used as the balancing weight
    pub fn procs(&self) -> u64 {
        self.nodes() * self.ppn()
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Expand the manifest into a flat, ordered list of job specs.
    ///
    /// Every fragment of every case is instanced `cases_repeats` times. A
    /// recognized parameter (a key of the global `default` section) resolves
    /// with precedence fragment -> case default -> global default. Output
    /// order is fixed for a fixed manifest: case tag x fragment x repeat.
    pub fn expand(&self) -> Result<Vec<JobSpec>, ManifestError> {
        let mut specs = Vec::new();

        for (tag, case) in self.cases.iter() {
            let fragments = if let Some(ref template) = case.cases_template {
                self.templates
                    .get(template)
                    .ok_or_else(|| ManifestError::UnknownTemplate {
                        case: tag.clone(),
                        template: template.clone(),
                    })?
            } else if !case.cases.is_empty() {
                &case.cases
            } else {
                return Err(ManifestError::EmptyCase(tag.clone()));
            };

            for (index, fragment) in fragments.iter().enumerate() {
                for key in fragment.keys() {
                    if !self.default.contains_key(key) {
                        warn!(case = %tag, key = %key, "fragment sets an unrecognized parameter, ignoring");
                    }
                }

                for repeat in 0..self.configuration.cases_repeats {
                    let params = self
                        .default
                        .iter()
                        .map(|(key, fallback)| {
                            let value = fragment
                                .get(key)
                                .or_else(|| case.default.get(key))
                                .unwrap_or(fallback);

                            (key.clone(), *value)
                        })
                        .collect();

                    specs.push(JobSpec {
                        name: format!("{tag}-c{index:02}-r{repeat}"),
                        case: tag.clone(),
                        repeat,
                        params,
                    });
                }
            }
        }

        Ok(specs)
    }
}

fn default_repeats() -> u32 {
    1
}
