//! CI provider detection.
//!
//! Two sources translate CI environment variables into settings:
//!
//! - [`PROVIDERS`], a static table of known CI services. Each entry pairs a
//!   detection predicate with an extraction function. The first entry whose
//!   predicate matches wins.
//! - [`ProviderMapping`], sent by the coordinator in the `env` message. It
//!   names the environment variables holding each setting, which lets the
//!   coordinator support new CI services without a client release.
//!
//! All lookups run against an [`Environ`] snapshot whose keys are upper-cased.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ProtocolError;

/// Provider name used when nothing matches.
pub const CUSTOM_PROVIDER: &str = "custom";

/// Snapshot of the process environment with upper-cased keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environ {
    vars: BTreeMap<String, String>,
}

impl Environ {
    /// Capture the current process environment.
    #[must_use]
    pub fn capture() -> Self {
        std::env::vars().collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&name.to_ascii_uppercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(&name.to_ascii_uppercase())
    }

    /// All variable names, upper-cased.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// First of `names` that is set to a non-empty value.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.get(name))
            .find(|value| !value.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environ {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into().to_ascii_uppercase(), v.into()))
                .collect(),
        }
    }
}

/// Settings values and context variables contributed by a CI provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderValues {
    pub provider: String,
    pub fields: BTreeMap<String, String>,
    pub context: BTreeMap<String, String>,
}

impl ProviderValues {
    fn collect(
        provider: &str,
        env: &Environ,
        fields: &[(&str, &[&str])],
        context: &[&str],
    ) -> Self {
        let mut values = Self {
            provider: provider.to_string(),
            ..Self::default()
        };
        for (setting, vars) in fields {
            if let Some(value) = env.first_of(vars) {
                values.fields.insert((*setting).to_string(), value.to_string());
            }
        }
        for var in context {
            if let Some(value) = env.get(var) {
                values.context.insert((*var).to_string(), value.to_string());
            }
        }
        values
    }

    pub fn get(&self, setting: &str) -> Option<&str> {
        self.fields.get(setting).map(String::as_str)
    }
}

/// One statically known CI service.
pub struct ProviderSpec {
    pub name: &'static str,
    pub detect: fn(&Environ) -> bool,
    pub extract: fn(&Environ) -> ProviderValues,
}

impl std::fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSpec").field("name", &self.name).finish()
    }
}

/// Known CI services, checked in order.
pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "appveyor",
        detect: |env| env.contains("CI") && env.contains("APPVEYOR"),
        extract: appveyor,
    },
    ProviderSpec {
        name: "bamboo",
        detect: |env| env.contains("CI") && env.contains("BAMBOO.BUILDKEY"),
        extract: bamboo,
    },
    ProviderSpec {
        name: "buildkite",
        detect: |env| env.contains("CI") && env.contains("BUILDKITE"),
        extract: buildkite,
    },
    ProviderSpec {
        name: "circle",
        detect: |env| env.contains("CI") && env.contains("CIRCLECI"),
        extract: circle,
    },
    ProviderSpec {
        name: "codeship",
        detect: |env| env.get("CI_NAME") == Some("codeship"),
        extract: codeship,
    },
    ProviderSpec {
        name: "drone",
        detect: |env| env.contains("CI") && env.contains("DRONE"),
        extract: drone,
    },
    ProviderSpec {
        name: "gitlab",
        detect: |env| env.contains("CI") && env.contains("GITLAB_CI"),
        extract: gitlab,
    },
    ProviderSpec {
        name: "jenkins",
        detect: |env| env.contains("JENKINS_URL"),
        extract: jenkins,
    },
    ProviderSpec {
        name: "semaphore",
        detect: |env| env.contains("CI") && env.contains("SEMAPHORE"),
        extract: semaphore,
    },
    ProviderSpec {
        name: "teamcity",
        detect: |env| env.contains("CI") && env.contains("TEAMCITY_VERSION"),
        extract: teamcity,
    },
    ProviderSpec {
        name: "travis",
        detect: |env| env.contains("CI") && env.contains("TRAVIS") && !env.contains("SHIPPABLE"),
        extract: travis,
    },
];

/// Run the static table against `env`.
pub fn detect(env: &Environ) -> Option<ProviderValues> {
    let provider = PROVIDERS.iter().find(|provider| (provider.detect)(env))?;
    debug!(provider = provider.name, "recognized CI environment");
    Some((provider.extract)(env))
}

// https://www.appveyor.com/docs/environment-variables/
fn appveyor(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "appveyor",
        env,
        &[
            ("build_id", &["APPVEYOR_BUILD_ID"]),
            ("build_project", &["APPVEYOR_PROJECT_SLUG"]),
            ("build_node", &["APPVEYOR_JOB_NUMBER"]),
            ("vcs_branch", &["APPVEYOR_REPO_BRANCH"]),
            ("vcs_pr", &["APPVEYOR_PULL_REQUEST_NUMBER"]),
            ("vcs_revision", &["APPVEYOR_REPO_COMMIT"]),
            ("vcs_revision_message", &["APPVEYOR_REPO_COMMIT_MESSAGE"]),
            ("vcs_tag", &["APPVEYOR_REPO_TAG_NAME"]),
        ],
        &["APPVEYOR_RE_BUILD"],
    )
}

fn bamboo(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "bamboo",
        env,
        &[
            ("build_id", &["BAMBOO.BUILDNUMBER"]),
            ("build_project", &["BAMBOO.PLANKEY"]),
            ("build_url", &["BAMBOO.BUILDRESULTSURL", "BAMBOO.RESULTSURL"]),
            ("build_node", &["BAMBOO.SHORTJOBKEY"]),
            ("vcs_branch", &["BAMBOO.PLANREPOSITORY.BRANCH"]),
            ("vcs_repo", &["BAMBOO.PLANREPOSITORY.REPOSITORYURL"]),
            ("vcs_revision", &["BAMBOO.PLANREPOSITORY.REVISION"]),
            ("vcs_type", &["BAMBOO.PLANREPOSITORY.TYPE"]),
        ],
        &["BAMBOO.BUILDKEY"],
    )
}

// https://buildkite.com/docs/pipelines/environment-variables
fn buildkite(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "buildkite",
        env,
        &[
            ("build_id", &["BUILDKITE_BUILD_NUMBER"]),
            ("build_url", &["BUILDKITE_BUILD_URL"]),
            ("build_pool", &["BUILDKITE_PARALLEL_JOB_COUNT"]),
            ("build_node", &["BUILDKITE_PARALLEL_JOB"]),
            ("vcs_branch", &["BUILDKITE_BRANCH"]),
            ("vcs_repo", &["BUILDKITE_REPO"]),
            ("vcs_revision", &["BUILDKITE_COMMIT"]),
            ("vcs_revision_message", &["BUILDKITE_MESSAGE"]),
            ("vcs_tag", &["BUILDKITE_TAG"]),
        ],
        &["BUILDKITE_AGENT_NAME", "BUILDKITE_COMMAND"],
    )
}

// https://circleci.com/docs/variables/#built-in-environment-variables
fn circle(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "circle",
        env,
        &[
            ("build_id", &["CIRCLE_BUILD_NUM"]),
            ("build_job", &["CIRCLE_JOB"]),
            ("build_url", &["CIRCLE_BUILD_URL"]),
            ("build_pool", &["CIRCLE_NODE_TOTAL"]),
            ("build_node", &["CIRCLE_NODE_INDEX"]),
            ("vcs_branch", &["CIRCLE_BRANCH"]),
            ("vcs_pr", &["CIRCLE_PR_NUMBER"]),
            ("vcs_repo", &["CIRCLE_REPOSITORY_URL"]),
            ("vcs_revision", &["CIRCLE_SHA1"]),
            ("vcs_tag", &["CIRCLE_TAG"]),
        ],
        &["CIRCLE_STAGE"],
    )
}

fn codeship(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "codeship",
        env,
        &[
            ("build_id", &["CI_BUILD_NUMBER", "CI_BUILD_ID"]),
            ("build_url", &["CI_BUILD_URL"]),
            ("vcs_branch", &["CI_BRANCH"]),
            ("vcs_revision", &["CI_COMMIT_ID"]),
            ("vcs_revision_message", &["CI_MESSAGE", "CI_COMMIT_MESSAGE"]),
        ],
        &["CI_PROJECT_ID"],
    )
}

fn drone(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "drone",
        env,
        &[
            ("build_id", &["DRONE_BUILD_NUMBER"]),
            ("build_url", &["DRONE_BUILD_LINK"]),
            ("build_node", &["DRONE_JOB_NUMBER"]),
            ("vcs_branch", &["DRONE_COMMIT_BRANCH"]),
            ("vcs_pr", &["DRONE_PULL_REQUEST"]),
            ("vcs_repo", &["DRONE_REPO_LINK"]),
            ("vcs_revision", &["DRONE_COMMIT_SHA"]),
            ("vcs_tag", &["DRONE_TAG"]),
        ],
        &[],
    )
}

// https://docs.gitlab.com/ee/ci/variables/
fn gitlab(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "gitlab",
        env,
        &[
            ("build_id", &["CI_JOB_NAME", "CI_BUILD_NAME"]),
            ("build_job", &["CI_JOB_STAGE", "CI_BUILD_STAGE"]),
            ("build_node", &["CI_RUNNER_ID"]),
            ("vcs_branch", &["CI_COMMIT_REF_NAME", "CI_BUILD_REF_NAME"]),
            ("vcs_repo", &["CI_REPOSITORY_URL"]),
            ("vcs_revision", &["CI_COMMIT_SHA", "CI_BUILD_REF"]),
            ("vcs_tag", &["CI_COMMIT_TAG", "CI_BUILD_TAG"]),
        ],
        &[
            "CI_RUNNER_REVISION",
            "CI_RUNNER_VERSION",
            "CI_SERVER_REVISION",
            "CI_SERVER_VERSION",
        ],
    )
}

fn jenkins(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "jenkins",
        env,
        &[
            ("build_id", &["BUILD_NUMBER"]),
            ("build_url", &["BUILD_URL"]),
            ("build_node", &["EXECUTOR_NUMBER"]),
            ("vcs_branch", &["GIT_BRANCH"]),
            ("vcs_revision", &["GIT_COMMIT"]),
        ],
        &["JOB_NAME", "NODE_NAME"],
    )
}

fn semaphore(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "semaphore",
        env,
        &[
            ("build_id", &["SEMAPHORE_BUILD_NUMBER"]),
            ("build_pool", &["SEMAPHORE_THREAD_COUNT"]),
            ("build_node", &["SEMAPHORE_CURRENT_THREAD"]),
            ("vcs_branch", &["BRANCH_NAME"]),
            ("vcs_pr", &["PULL_REQUEST_NUMBER"]),
            ("vcs_revision", &["REVISION"]),
        ],
        &[
            "SEMAPHORE_CURRENT_JOB",
            "SEMAPHORE_JOB_COUNT",
            "SEMAPHORE_TRIGGER_SOURCE",
        ],
    )
}

fn teamcity(env: &Environ) -> ProviderValues {
    ProviderValues::collect(
        "teamcity",
        env,
        &[
            ("build_id", &["BUILD_NUMBER"]),
            ("build_project", &["TEAMCITY_PROJECT_NAME"]),
            ("vcs_revision", &["BUILD_VCS_NUMBER"]),
        ],
        &["TEAMCITY_VERSION"],
    )
}

// https://docs.travis-ci.com/user/environment-variables/#default-environment-variables
fn travis(env: &Environ) -> ProviderValues {
    let mut values = ProviderValues::collect(
        "travis",
        env,
        &[
            ("build_id", &["TRAVIS_BUILD_NUMBER"]),
            ("build_project", &["TRAVIS_REPO_SLUG"]),
            ("build_node", &["TRAVIS_JOB_NUMBER"]),
            ("vcs_revision", &["TRAVIS_COMMIT"]),
            ("vcs_revision_message", &["TRAVIS_COMMIT_MESSAGE"]),
            ("vcs_tag", &["TRAVIS_TAG"]),
        ],
        &["TRAVIS_EVENT_TYPE"],
    );
    let pull_request = env.get("TRAVIS_PULL_REQUEST").filter(|pr| *pr != "false");
    let branch = match pull_request {
        None => env.get("TRAVIS_BRANCH"),
        Some(_) => env.get("TRAVIS_PULL_REQUEST_BRANCH"),
    };
    if let Some(branch) = branch {
        values.fields.insert("vcs_branch".into(), branch.to_string());
    }
    if let Some(pr) = pull_request {
        values.fields.insert("vcs_pr".into(), pr.to_string());
    }
    values
}

// =============================================================================
// Coordinator-supplied mapping
// =============================================================================

#[derive(Debug, Deserialize)]
struct MappingEntry {
    name: String,
    #[serde(default)]
    conditions: Vec<String>,
    #[serde(default)]
    mapping: BTreeMap<String, Value>,
}

/// Mapping from setting names to environment variables, chosen from the `env` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderMapping {
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub context_vars: Vec<String>,
}

impl ProviderMapping {
    /// Pick the first entry of an `env` payload whose conditions all hold.
    pub fn resolve(payload: &Value, env: &Environ) -> Result<Option<Self>, ProtocolError> {
        let entries: Vec<MappingEntry> =
            serde_json::from_value(payload.clone()).map_err(|e| ProtocolError::MalformedPayload {
                message_type: "env".into(),
                reason: e.to_string(),
            })?;

        let Some(entry) = entries
            .into_iter()
            .find(|entry| entry.conditions.iter().all(|c| env.contains(c)))
        else {
            return Ok(None);
        };

        let mut mapping = Self {
            name: entry.name,
            ..Self::default()
        };
        for (setting, value) in entry.mapping {
            match value {
                Value::String(var) => {
                    mapping.fields.insert(setting, var);
                }
                Value::Array(vars) if setting == "system_context" => {
                    mapping.context_vars = vars
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
                _ => {}
            }
        }
        Ok(Some(mapping))
    }

    /// Read the mapped variables out of `env`.
    #[must_use]
    pub fn values(&self, env: &Environ) -> ProviderValues {
        let mut values = ProviderValues {
            provider: self.name.clone(),
            ..ProviderValues::default()
        };
        for (setting, var) in &self.fields {
            if let Some(value) = env.get(var) {
                values.fields.insert(setting.clone(), value.to_string());
            }
        }
        for var in &self.context_vars {
            if let Some(value) = env.get(var) {
                values.context.insert(var.clone(), value.to_string());
            }
        }
        values
    }
}
