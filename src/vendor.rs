use serde::{Deserialize, Serialize};

/// A CI vendor dialect.
///
/// The set is closed: adding a vendor means adding a variant, a parser and
/// registry data for it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Vendor {
    GithubActions,
    Circleci,
    BitbucketPipelines,
    GitlabCi,
    Jenkins,
    Buildkite,
}

impl Vendor {
    /// Vendors that have a dialect parser.
    pub const SOURCES: [Vendor; 5] = [
        Vendor::GithubActions,
        Vendor::Circleci,
        Vendor::BitbucketPipelines,
        Vendor::GitlabCi,
        Vendor::Jenkins,
    ];

    /// Vendors that have an emitter.
    pub const TARGETS: [Vendor; 1] = [Vendor::Buildkite];

    /// Stable identifier used in rule data, CLI flags and reports.
    pub fn id(self) -> &'static str {
        match self {
            Self::GithubActions => "github-actions",
            Self::Circleci => "circleci",
            Self::BitbucketPipelines => "bitbucket-pipelines",
            Self::GitlabCi => "gitlab-ci",
            Self::Jenkins => "jenkins",
            Self::Buildkite => "buildkite",
        }
    }

    /// Human-readable vendor name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::GithubActions => "GitHub Actions",
            Self::Circleci => "CircleCI",
            Self::BitbucketPipelines => "Bitbucket Pipelines",
            Self::GitlabCi => "GitLab CI",
            Self::Jenkins => "Jenkins",
            Self::Buildkite => "Buildkite",
        }
    }

    pub fn is_source(self) -> bool {
        Self::SOURCES.contains(&self)
    }

    pub fn is_target(self) -> bool {
        Self::TARGETS.contains(&self)
    }

    /// Parses a vendor identifier as written in rule data.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::SOURCES
            .iter()
            .chain(Self::TARGETS.iter())
            .copied()
            .find(|v| v.id() == id)
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// The (source, target) dialects of one translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorPair {
    pub source: Vendor,
    pub target: Vendor,
}

impl VendorPair {
    pub fn new(source: Vendor, target: Vendor) -> Self {
        Self { source, target }
    }
}
