//! Executor that leaves evaluation and building to a hosted CI service and
//! only substitutes the finished system from its binary cache.
//!
//! Eval polls the CI commit endpoint until the host's configuration has been
//! uploaded, then reads the output path out of the cached derivation. The
//! derivation to output mapping lives in a small LRU; it only has to bridge
//! an Eval and the Build that follows it.

use std::num::NonZeroUsize;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use lru::LruCache;
use serde::Deserialize;
use tracing::{error, info, instrument};
use url::Url;

use crate::core::deployment::{Activation, Operation};
use crate::core::generation::Evaluation;
use crate::error::Error;
use crate::executor::Executor;
use crate::executor::activation::{Activator, SystemActivator, activate};
use crate::io::binary_cache::BinaryCache;
use crate::io::nix::Nix;

const CONFIGURATION_PACKAGE_TYPE: &str = "nixosConfiguration";

/// One build entry of a CI commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CiBuild {
    pub id: String,
    pub drv_path: String,
    pub package_type: String,
    pub package: String,
    pub uploaded_to_cache: bool,
    pub end_time: Option<String>,
    pub status: String,
}

impl CiBuild {
    fn failed(&self) -> bool {
        self.end_time.as_deref().is_some_and(|t| !t.is_empty()) && self.status != "Success"
    }
}

#[derive(Debug, Deserialize)]
struct CommitBuilds {
    #[serde(default)]
    builds: Vec<CiBuild>,
}

/// What the executor needs from the CI service and its cache.
pub trait CiApi {
    fn commit_builds(&mut self, rev: &str) -> Result<Vec<CiBuild>>;
    fn resolve_out_path(&mut self, drv_path: &str) -> Result<String>;
}

/// Where resolved outputs get realised.
pub trait Store {
    fn realise(&mut self, out_path: &str) -> Result<()>;
}

impl Store for Nix {
    fn realise(&mut self, out_path: &str) -> Result<()> {
        self.build(out_path)
    }
}

/// CI service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCi {
    base: Url,
    agent: ureq::Agent,
    cache: BinaryCache,
}

impl HttpCi {
    pub fn new(base_url: &str, cache_url: &str, agent: ureq::Agent) -> Result<Self> {
        let base = directory_url(base_url).context("ci base url")?;
        let cache = directory_url(cache_url).context("ci cache url")?;
        Ok(Self {
            base,
            cache: BinaryCache::new(cache, agent.clone()),
            agent,
        })
    }
}

impl CiApi for HttpCi {
    fn commit_builds(&mut self, rev: &str) -> Result<Vec<CiBuild>> {
        let url = self
            .base
            .join(&format!("api/commits/{rev}"))
            .context("build commit url")?;
        info!(url = %url, "fetching commit builds");
        let commit: CommitBuilds = self
            .agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("GET {url}"))?
            .into_json()
            .context("decode commit builds")?;
        Ok(commit.builds)
    }

    fn resolve_out_path(&mut self, drv_path: &str) -> Result<String> {
        self.cache.resolve_out_path(drv_path)
    }
}

fn directory_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("parse url {raw}"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Polling behaviour of [`RemoteCiExecutor::eval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub retry_interval: Duration,
    /// Stop polling after this long; `None` polls until the build shows up.
    pub timeout: Option<Duration>,
}

pub struct RemoteCiExecutor<C: CiApi = HttpCi, S: Store = Nix, A: Activator = SystemActivator> {
    ci: C,
    store: S,
    activator: A,
    poll: PollPolicy,
    drv_to_out: LruCache<String, String>,
}

impl<C: CiApi, S: Store, A: Activator> RemoteCiExecutor<C, S, A> {
    pub fn new(ci: C, store: S, activator: A, poll: PollPolicy, cache_size: NonZeroUsize) -> Self {
        Self {
            ci,
            store,
            activator,
            poll,
            drv_to_out: LruCache::new(cache_size),
        }
    }

    pub fn ci(&self) -> &C {
        &self.ci
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<C: CiApi, S: Store, A: Activator> Executor for RemoteCiExecutor<C, S, A> {
    #[instrument(skip_all, fields(hostname = %hostname))]
    fn eval(&mut self, flake_url: &str, hostname: &str) -> Result<Evaluation> {
        let rev = revision(flake_url).ok_or_else(|| Error::MissingRevision {
            flake_url: flake_url.to_string(),
        })?;
        let started = Instant::now();

        loop {
            let builds = self.ci.commit_builds(&rev)?;
            let build = builds
                .into_iter()
                .find(|b| b.package_type == CONFIGURATION_PACKAGE_TYPE && b.package == hostname);
            match build {
                Some(build) if build.uploaded_to_cache => {
                    let out_path = self.ci.resolve_out_path(&build.drv_path).with_context(|| {
                        format!("resolve output of {} from cache", build.drv_path)
                    })?;
                    info!(drv_path = %build.drv_path, out_path = %out_path, "build found in cache");
                    self.drv_to_out.put(build.drv_path.clone(), out_path.clone());
                    return Ok(Evaluation {
                        drv_path: build.drv_path,
                        out_path,
                        machine_id: None,
                    });
                }
                Some(build) => {
                    if build.failed() {
                        error!(rev = %rev, build_id = %build.id, status = %build.status, "ci build failed");
                    }
                    info!(rev = %rev, "not uploaded to cache yet, retrying");
                }
                None => info!(rev = %rev, "no ci build for this host yet, retrying"),
            }

            if let Some(limit) = self.poll.timeout {
                if started.elapsed() >= limit {
                    return Err(Error::EvalFailed {
                        hostname: hostname.to_string(),
                        reason: format!(
                            "ci build of {rev} not in cache after {}s",
                            limit.as_secs()
                        ),
                    }
                    .into());
                }
            }
            thread::sleep(self.poll.retry_interval);
        }
    }

    fn build(&mut self, drv_path: &str) -> Result<()> {
        let out_path = self
            .drv_to_out
            .get(drv_path)
            .cloned()
            .ok_or_else(|| Error::BuildBeforeEval {
                drv_path: drv_path.to_string(),
            })?;
        self.store.realise(&out_path)
    }

    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation> {
        activate(&mut self.activator, out_path, operation)
    }
}

/// `rev` query parameter of a flake reference.
pub fn revision(flake_url: &str) -> Option<String> {
    let (_, query) = flake_url.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "rev")
        .map(|(_, value)| value.into_owned())
        .filter(|rev| !rev.is_empty())
}

/// Turn a user supplied cache size into an LRU capacity.
pub fn cache_capacity(size: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(size).ok_or_else(|| anyhow!("cache size must be > 0"))
}
