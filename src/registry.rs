//! # Flow Registry
//!
//! A durable, filesystem-backed directory of endpoints, flows and policy
//! records, shared between every process on the host that mounts the
//! same root. The hierarchy is
//!
//! ```text
//! <root>/<namespace>/<user>/<service>/<application>/
//! <root>/<namespace>/<user>/<service>/<application>/flow_XXXX/
//! <root>/<namespace>/<user>/<service>/<application>/flow_XXXX/<policy>.json
//! ```
//!
//! Concurrent readers are tolerated by construction: flow directories are
//! made with the OS's atomic unique-tempdir primitive, policy files are
//! rewritten whole via write-then-rename, and every read re-scans the
//! directory listing rather than trusting an in-memory index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::{Builder, NamedTempFile};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::defaults;
use crate::message::Address;
use crate::policy::{self, PolicyValue};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad connection url: {0}")]
    BadUrl(#[from] url::ParseError),
}

/// The identity of an endpoint within the network, anchored to a
/// registry root.
///
/// The first four fields are the endpoint's canonical [`Address`];
/// minting a token creates the endpoint's registry directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub root: PathBuf,
    pub namespace: String,
    pub user: String,
    pub service: String,
    pub application: String,
}

impl Token {
    pub fn address(&self) -> Address {
        Address::new(&self.namespace, &self.user, &self.service, &self.application)
    }

    /// `<root>/<namespace>/<user>/<service>`
    fn service_dir(&self) -> PathBuf {
        self.root
            .join(&self.namespace)
            .join(&self.user)
            .join(&self.service)
    }

    /// `<root>/<namespace>/<user>/<service>/<application>`
    fn endpoint_dir(&self) -> PathBuf {
        self.service_dir().join(&self.application)
    }
}

/// A handle on one policy record inside one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub root: PathBuf,
    pub namespace: String,
    pub user: String,
    pub service: String,
    pub application: String,
    pub flow: String,
    pub policy: String,
    pub suffix: String,
}

impl Resource {
    /// The absolute path of the policy file this handle names.
    pub fn path(&self) -> PathBuf {
        self.root
            .join(&self.namespace)
            .join(&self.user)
            .join(&self.service)
            .join(&self.application)
            .join(&self.flow)
            .join(format!("{}{}", self.policy, self.suffix))
    }
}

/// Mint a token for an application endpoint.
///
/// `connect` is the registry root as a `file://` URL; any other scheme
/// earns a warning and no token, which callers treat as fatal. The
/// endpoint directory is created on first minting. The user field is
/// the current OS user.
pub fn token(connect: &str, service: &str, application: &str) -> Result<Option<Token>, RegistryError> {
    let url = Url::parse(connect)?;
    if url.scheme() != "file" {
        warn!("only a file-based policy cache is available");
        return Ok(None);
    }

    let token = Token {
        root: PathBuf::from(url.path()),
        namespace: defaults::NAMESPACE.to_string(),
        user: whoami::username(),
        service: service.to_string(),
        application: application.to_string(),
    };
    fs::create_dir_all(token.endpoint_dir())?;
    Ok(Some(token))
}

/// The policy names requested of one [`create`] call, grouped by
/// registry.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub poa: Vec<String>,
    pub role: Vec<String>,
    pub routing: Vec<String>,
}

impl CreateRequest {
    fn names(&self) -> impl Iterator<Item = (policy::PolicyRegistry, &str)> {
        let poa = self
            .poa
            .iter()
            .map(|n| (policy::PolicyRegistry::Poa, n.as_str()));
        let role = self
            .role
            .iter()
            .map(|n| (policy::PolicyRegistry::Role, n.as_str()));
        let routing = self
            .routing
            .iter()
            .map(|n| (policy::PolicyRegistry::Routing, n.as_str()));
        poa.chain(role).chain(routing)
    }
}

/// Create a fresh flow under the endpoint and populate it with policy
/// records.
///
/// Pooled policies gather every live value of their kind across the
/// whole endpoint space before allocating, so no two flows end up
/// sharing an identity key. An unregistered policy name earns a warning
/// and a `None` in its slot; the other requests still land.
pub fn create(
    token: &Token,
    request: &CreateRequest,
) -> Result<Vec<Option<Resource>>, RegistryError> {
    let parent = token.endpoint_dir();
    fs::create_dir_all(&parent)?;

    // Unique directory name, atomically claimed.
    let flow_dir = Builder::new()
        .prefix(defaults::FLOW_PREFIX)
        .tempdir_in(&parent)?
        .into_path();
    let flow = flow_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut resources = Vec::new();
    for (registry, name) in request.names() {
        let Some(spec) = policy::lookup(name) else {
            warn!("no policy registered for '{}'", name);
            resources.push(None);
            continue;
        };
        if spec.registry != registry {
            warn!("policy '{}' requested under the wrong registry", name);
            resources.push(None);
            continue;
        }

        let value = if spec.pooled {
            // Everything live of this kind, across every application in scope.
            let existing: Vec<PolicyValue> = find(token, Some("*"), Some(name))?
                .iter()
                .filter_map(inspect)
                .collect();
            match spec.allocate(&existing) {
                Some(value) => value,
                None => {
                    warn!("pool exhausted for policy '{}'", name);
                    resources.push(None);
                    continue;
                }
            }
        } else {
            spec.construct()
        };

        let resource = Resource {
            root: token.root.clone(),
            namespace: token.namespace.clone(),
            user: token.user.clone(),
            service: token.service.clone(),
            application: token.application.clone(),
            flow: flow.clone(),
            policy: name.to_string(),
            suffix: defaults::POLICY_SUFFIX.to_string(),
        };
        replace(&resource, &value)?;
        resources.push(Some(resource));
    }
    Ok(resources)
}

/// Enumerate policy records in the scope the token implies.
///
/// `application` of `"*"` (or `None`) widens the search to every
/// application under the same `(namespace, user, service)`; `policy`
/// widens the same way over policy kinds. Results come newest first by
/// file modification time.
pub fn find(
    token: &Token,
    application: Option<&str>,
    policy_name: Option<&str>,
) -> Result<Vec<Resource>, RegistryError> {
    let mut hits: Vec<(SystemTime, Resource)> = Vec::new();

    let applications: Vec<String> = match application {
        Some(name) if name != "*" => vec![name.to_string()],
        _ => list_dirs(&token.service_dir())?,
    };

    for application in &applications {
        let endpoint_dir = token.service_dir().join(application);
        for flow in list_dirs(&endpoint_dir)? {
            if !is_flow_name(&flow) {
                continue;
            }
            let flow_dir = endpoint_dir.join(&flow);
            for entry in read_dir_or_empty(&flow_dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(stem) = file_name.strip_suffix(defaults::POLICY_SUFFIX) else {
                    continue;
                };
                match policy_name {
                    Some(wanted) if wanted != "*" && wanted != stem => continue,
                    _ => {}
                }
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                hits.push((
                    modified,
                    Resource {
                        root: token.root.clone(),
                        namespace: token.namespace.clone(),
                        user: token.user.clone(),
                        service: token.service.clone(),
                        application: application.clone(),
                        flow: flow.clone(),
                        policy: stem.to_string(),
                        suffix: defaults::POLICY_SUFFIX.to_string(),
                    },
                ));
            }
        }
    }

    hits.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(hits.into_iter().map(|(_, resource)| resource).collect())
}

/// Read a resource back as a policy value.
///
/// `None` for a missing file, an unregistered policy name, or an
/// undecodable record; each case is logged and the caller moves on.
pub fn inspect(resource: &Resource) -> Option<PolicyValue> {
    let spec = match policy::lookup(&resource.policy) {
        Some(spec) => spec,
        None => {
            warn!("no policy registered for '{}'", resource.policy);
            return None;
        }
    };
    let text = match fs::read_to_string(resource.path()) {
        Ok(text) => text,
        Err(fault) => {
            warn!("unreadable policy record {:?}: {}", resource.path(), fault);
            return None;
        }
    };
    match spec.decode(&text) {
        Ok(value) => Some(value),
        Err(fault) => {
            warn!("undecodable policy record {:?}: {}", resource.path(), fault);
            None
        }
    }
}

/// Overwrite a policy record with the canonical encoding of `value`.
///
/// The write lands in a temporary file beside the target and is renamed
/// into place, so readers never observe a partial record.
pub fn replace(resource: &Resource, value: &PolicyValue) -> Result<(), RegistryError> {
    let spec = match policy::lookup(&resource.policy) {
        Some(spec) => spec,
        None => {
            warn!("no policy registered for '{}'", resource.policy);
            return Ok(());
        }
    };
    let Some(text) = spec.encode(value) else {
        warn!(
            "value of the wrong kind for policy '{}'; record unchanged",
            resource.policy
        );
        return Ok(());
    };

    let target = resource.path();
    let dir = target.parent().unwrap_or(Path::new("."));
    let staging = NamedTempFile::new_in(dir)?;
    fs::write(staging.path(), text)?;
    staging
        .persist(&target)
        .map_err(|fault| RegistryError::Io(fault.error))?;
    Ok(())
}

fn is_flow_name(name: &str) -> bool {
    name.strip_prefix(defaults::FLOW_PREFIX)
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(false)
}

fn list_dirs(path: &Path) -> Result<Vec<String>, RegistryError> {
    let mut names = Vec::new();
    for entry in read_dir_or_empty(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// A missing directory is an empty scope, not a fault; the registry is
/// populated lazily.
fn read_dir_or_empty(
    path: &Path,
) -> Result<Box<dyn Iterator<Item = std::io::Result<fs::DirEntry>>>, RegistryError> {
    match fs::read_dir(path) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(fault) if fault.kind() == std::io::ErrorKind::NotFound => {
            Ok(Box::new(std::iter::empty()))
        }
        Err(fault) => Err(fault.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PoaUdp, Rule};
    use tempfile::TempDir;

    fn test_token(root: &TempDir, application: &str) -> Token {
        token(
            &format!("file://{}", root.path().display()),
            "test",
            application,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_token_creates_endpoint_directory() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");

        assert_eq!(tok.root, root.path());
        assert_eq!(tok.namespace, "turberfield");
        assert_eq!(tok.user, whoami::username());
        assert_eq!(tok.application, "demo.web");
        assert!(root
            .path()
            .join("turberfield")
            .join(whoami::username())
            .join("test")
            .join("demo.web")
            .is_dir());
    }

    #[test]
    fn test_token_rejects_other_schemes() {
        let root = TempDir::new().unwrap();
        let tok = token(
            &format!("http://example.com{}", root.path().display()),
            "test",
            "demo.web",
        )
        .unwrap();
        assert_eq!(tok, None);
    }

    #[test]
    fn test_find_on_empty_registry() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");
        assert!(find(&tok, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_create_allocates_udp_poa() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");

        let resources = create(
            &tok,
            &CreateRequest {
                poa: vec!["udp".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(resources.len(), 1);
        let resource = resources[0].as_ref().unwrap();
        assert_eq!(resource.policy, "udp");
        assert_eq!(resource.suffix, ".json");

        let value = inspect(resource).unwrap();
        let poa = value.as_udp().unwrap();
        assert_eq!(poa.addr, "127.0.0.1");
        assert!((crate::defaults::POA_PORT_MIN..=crate::defaults::POA_PORT_MAX)
            .contains(&poa.port));
    }

    #[test]
    fn test_second_create_avoids_first_port() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");
        let request = CreateRequest {
            poa: vec!["udp".to_string()],
            ..Default::default()
        };

        let first = create(&tok, &request).unwrap();
        let second = create(&tok, &request).unwrap();
        let a = inspect(first[0].as_ref().unwrap()).unwrap();
        let b = inspect(second[0].as_ref().unwrap()).unwrap();
        assert_ne!(a.as_udp().unwrap().key(), b.as_udp().unwrap().key());
    }

    #[test]
    fn test_create_unregistered_policy_yields_nothing() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");

        let resources = create(
            &tok,
            &CreateRequest {
                poa: vec!["ftp".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(resources, vec![None]);
        assert!(find(&tok, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_name_under_wrong_registry() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");

        // "udp" is a POA name; requesting it as a role creates nothing.
        let resources = create(
            &tok,
            &CreateRequest {
                role: vec!["udp".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(resources, vec![None]);
    }

    #[test]
    fn test_routing_table_round_trip_through_registry() {
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "demo.web");

        let resources = create(
            &tok,
            &CreateRequest {
                poa: vec!["udp".to_string()],
                routing: vec!["application".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        let routes = resources[1].as_ref().unwrap();

        let mut table = inspect(routes).unwrap().as_table().unwrap().clone();
        assert!(table.is_empty());

        let rule = Rule {
            src: Address::new("turberfield", &tok.user, "test", "demo.sender"),
            dst: Address::new("turberfield", &tok.user, "test", "demo.receiver"),
            h_max: 1,
            via: Address::new("turberfield", &tok.user, "test", "demo.hub"),
        };
        assert_eq!(table.replace(&rule.src, &rule.dst, Some(rule.clone())), None);

        replace(routes, &PolicyValue::Application(table.clone())).unwrap();
        let reread = inspect(routes).unwrap();
        assert_eq!(reread.as_table().unwrap(), &table);
    }

    #[test]
    fn test_find_filters_by_application_and_policy() {
        let root = TempDir::new().unwrap();
        let web = test_token(&root, "demo.web");
        let game = test_token(&root, "demo.game");
        let request = CreateRequest {
            poa: vec!["udp".to_string()],
            routing: vec!["application".to_string()],
            ..Default::default()
        };
        create(&web, &request).unwrap();
        create(&game, &request).unwrap();

        // Wildcard scope sees both applications.
        let all = find(&web, Some("*"), Some("udp")).unwrap();
        assert_eq!(all.len(), 2);

        // A named application narrows to its own flows.
        let only = find(&web, Some("demo.game"), None).unwrap();
        assert!(only.iter().all(|r| r.application == "demo.game"));
        assert_eq!(only.len(), 2);

        // Nothing matches an application that never minted a flow.
        assert!(find(&web, Some("demo.other"), None).unwrap().is_empty());
    }

    #[test]
    fn test_pooled_uniqueness_across_applications() {
        let root = TempDir::new().unwrap();
        let request = CreateRequest {
            poa: vec!["udp".to_string()],
            ..Default::default()
        };
        for application in ["demo.a", "demo.b", "demo.c", "demo.d"] {
            let tok = test_token(&root, application);
            create(&tok, &request).unwrap();
        }

        let tok = test_token(&root, "demo.a");
        let keys: Vec<(String, u16)> = find(&tok, Some("*"), Some("udp"))
            .unwrap()
            .iter()
            .filter_map(inspect)
            .filter_map(|v| v.as_udp().map(PoaUdp::key))
            .collect();
        let unique: std::collections::HashSet<_> = keys.iter().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(unique.len(), keys.len());
    }
}
