//! # Capability
//!
//! URN-identified permission grants attached to a process at spawn.
//!
//! ## Design Principles
//!
//! 1. **Unforgeable**: grants are constructed by the supervisor from the
//!    spawn arguments; modules never mint them.
//! 2. **Closed world**: an outbound topic with no covering grant is a
//!    permission failure, never a default-allow.
//! 3. **Subset delegation**: a child's capability set must be covered by
//!    its parent's, unless the host explicitly grants escalation.
//! 4. **Affinity aware**: a `Pinned` grant demands a persistent module
//!    instance and refuses `Stateless` pooling at load time.
//!
//! Topic matching is byte-exact; the single permitted wildcard is a
//! trailing `/*` segment covering a topic family such as `filament/fs/*`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use core_types::{validate_uri, KernelError, PoolingMode};

/// Errors raised while building capability structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityParseError {
    #[error("capability token must start with 'urn:': {0}")]
    NotAUrn(String),

    #[error("malformed topic pattern: {0}")]
    BadPattern(String),

    #[error("invalid URI in capability: {0}")]
    BadUri(String),
}

impl From<CapabilityParseError> for KernelError {
    fn from(err: CapabilityParseError) -> Self {
        KernelError::Invalid(err.to_string())
    }
}

/// A validated capability URN token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapabilityUrn(String);

impl CapabilityUrn {
    /// Parses a URN token, e.g. `urn:filament:cap:timer`.
    pub fn parse(token: impl Into<String>) -> Result<Self, CapabilityParseError> {
        let token = token.into();
        validate_uri(&token).map_err(|e| CapabilityParseError::BadUri(e.to_string()))?;
        if !token.starts_with("urn:") || token.len() == 4 {
            return Err(CapabilityParseError::NotAUrn(token));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a capability may serve pooled stateless instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Affinity {
    /// Usable from any instance, pooled or not.
    Agnostic,
    /// Demands a persistent instance; refused for `Stateless` modules.
    Pinned,
}

/// Host functions a grant may authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostFn {
    Read,
    Write,
    BlobAlloc,
    BlobMap,
    BlobRetain,
    TlOpen,
    TlNext,
    TlClose,
    ChannelCreate,
    ProcessSpawn,
    ProcessTerminate,
}

impl HostFn {
    /// The import symbol in the `filament` namespace.
    pub fn symbol(&self) -> &'static str {
        match self {
            HostFn::Read => "read",
            HostFn::Write => "write",
            HostFn::BlobAlloc => "blob_alloc",
            HostFn::BlobMap => "blob_map",
            HostFn::BlobRetain => "blob_retain",
            HostFn::TlOpen => "tl_open",
            HostFn::TlNext => "tl_next",
            HostFn::TlClose => "tl_close",
            HostFn::ChannelCreate => "channel_create",
            HostFn::ProcessSpawn => "process_spawn",
            HostFn::ProcessTerminate => "process_terminate",
        }
    }
}

/// One topic pattern: exact bytes, or a trailing-`/*` family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicPattern {
    Exact(String),
    /// Matches any topic starting with the stored prefix (which keeps
    /// its trailing slash).
    Family(String),
}

impl TopicPattern {
    /// Parses a pattern string. `a/b/*` becomes a family over `a/b/`.
    pub fn parse(pattern: &str) -> Result<Self, CapabilityParseError> {
        if pattern == "*" || pattern.ends_with("/*") && pattern.len() == 2 {
            return Err(CapabilityParseError::BadPattern(pattern.to_string()));
        }
        if let Some(head) = pattern.strip_suffix("/*") {
            let prefix = format!("{}/", head);
            validate_uri(head).map_err(|e| CapabilityParseError::BadUri(e.to_string()))?;
            return Ok(TopicPattern::Family(prefix));
        }
        validate_uri(pattern).map_err(|e| CapabilityParseError::BadUri(e.to_string()))?;
        Ok(TopicPattern::Exact(pattern.to_string()))
    }

    /// Byte-exact match of a concrete topic against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(exact) => exact == topic,
            TopicPattern::Family(prefix) => topic.as_bytes().starts_with(prefix.as_bytes()),
        }
    }

    /// True when every topic matched by `self` is matched by `other`.
    pub fn covered_by(&self, other: &TopicPattern) -> bool {
        match (self, other) {
            (TopicPattern::Exact(topic), _) => other.matches(topic),
            (TopicPattern::Family(prefix), TopicPattern::Family(wider)) => {
                prefix.as_bytes().starts_with(wider.as_bytes())
            }
            (TopicPattern::Family(_), TopicPattern::Exact(_)) => false,
        }
    }
}

/// A set of topic patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopicSet {
    patterns: Vec<TopicPattern>,
}

impl TopicSet {
    pub fn new(patterns: Vec<TopicPattern>) -> Self {
        Self { patterns }
    }

    /// Parses a list of pattern strings.
    pub fn parse(patterns: &[&str]) -> Result<Self, CapabilityParseError> {
        Ok(Self { patterns: patterns.iter().map(|p| TopicPattern::parse(p)).collect::<Result<_, _>>()? })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(topic))
    }

    /// True when every topic this set admits is admitted by `other`.
    pub fn is_subset_of(&self, other: &TopicSet) -> bool {
        self.patterns.iter().all(|p| other.patterns.iter().any(|q| p.covered_by(q)))
    }
}

/// A single capability grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub urn: CapabilityUrn,
    pub affinity: Affinity,
    pub host_fns: BTreeSet<HostFn>,
    pub inbound: TopicSet,
    pub outbound: TopicSet,
}

impl CapabilityGrant {
    pub fn new(urn: CapabilityUrn, affinity: Affinity) -> Self {
        Self {
            urn,
            affinity,
            host_fns: BTreeSet::new(),
            inbound: TopicSet::default(),
            outbound: TopicSet::default(),
        }
    }

    pub fn with_host_fns(mut self, fns: impl IntoIterator<Item = HostFn>) -> Self {
        self.host_fns.extend(fns);
        self
    }

    pub fn with_inbound(mut self, topics: TopicSet) -> Self {
        self.inbound = topics;
        self
    }

    pub fn with_outbound(mut self, topics: TopicSet) -> Self {
        self.outbound = topics;
        self
    }

    /// True when this grant is no wider than `parent`.
    pub fn covered_by(&self, parent: &CapabilityGrant) -> bool {
        self.host_fns.is_subset(&parent.host_fns)
            && self.inbound.is_subset_of(&parent.inbound)
            && self.outbound.is_subset_of(&parent.outbound)
    }
}

/// The capability set attached to a process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    grants: Vec<CapabilityGrant>,
}

impl CapabilitySet {
    pub fn new(grants: Vec<CapabilityGrant>) -> Self {
        Self { grants }
    }

    pub fn grants(&self) -> &[CapabilityGrant] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Finds the grant authorizing an outbound emission on `topic`.
    pub fn find_outbound(&self, topic: &str) -> Option<&CapabilityGrant> {
        self.grants.iter().find(|g| g.outbound.matches(topic))
    }

    /// Finds the grant authorizing an inbound delivery on `topic`.
    pub fn find_inbound(&self, topic: &str) -> Option<&CapabilityGrant> {
        self.grants.iter().find(|g| g.inbound.matches(topic))
    }

    /// True when any grant authorizes the host function.
    pub fn allows_host_fn(&self, host_fn: HostFn) -> bool {
        self.grants.iter().any(|g| g.host_fns.contains(&host_fn))
    }

    /// Verifies this set is covered by `parent`, grant by grant.
    ///
    /// Each grant must name a URN the parent also holds, with no wider
    /// host functions or topic sets.
    pub fn is_subset_of(&self, parent: &CapabilitySet) -> bool {
        self.grants.iter().all(|child| {
            parent
                .grants
                .iter()
                .any(|p| p.urn == child.urn && child.covered_by(p))
        })
    }

    /// Enforces affinity against the pooling mode of a loading module.
    pub fn check_affinity(&self, pooling: PoolingMode) -> Result<(), KernelError> {
        if pooling == PoolingMode::Stateless {
            if let Some(pinned) = self.grants.iter().find(|g| g.affinity == Affinity::Pinned) {
                return Err(KernelError::Permission(format!(
                    "pinned capability {} cannot be granted to a stateless module",
                    pinned.urn
                )));
            }
        }
        Ok(())
    }
}
