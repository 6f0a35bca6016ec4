//! Read derivations out of a Nix binary cache over HTTP.
//!
//! Only what the remote CI executor needs: look up `<hash>.narinfo`,
//! download the uncompressed NAR holding the `.drv` file, and take the `out`
//! path from the derivation. The cache formats are decoded by `nix-compat`.

use std::io::Read;

use anyhow::{Context, Result, anyhow, bail};
use nix_compat::derivation::Derivation;
use nix_compat::nar;
use nix_compat::narinfo::NarInfo;
use nix_compat::nixbase32;
use nix_compat::store_path::StorePathRef;
use tracing::{debug, instrument};
use url::Url;

use crate::error::Error;

const MAX_NAR_BYTES: u64 = 64 * 1024 * 1024;

/// HTTP client bound to one cache base URL.
#[derive(Debug, Clone)]
pub struct BinaryCache {
    base: Url,
    agent: ureq::Agent,
}

impl BinaryCache {
    pub fn new(base: Url, agent: ureq::Agent) -> Self {
        Self { base, agent }
    }

    /// Output path of `drv_path`, read from the cached derivation.
    #[instrument(skip_all, fields(drv_path = %drv_path))]
    pub fn resolve_out_path(&self, drv_path: &str) -> Result<String> {
        let key = cache_key(drv_path)?;
        let narinfo_url = self
            .base
            .join(&format!("{key}.narinfo"))
            .context("build narinfo url")?;
        debug!(url = %narinfo_url, "fetching narinfo");
        let body = self
            .agent
            .get(narinfo_url.as_str())
            .call()
            .with_context(|| format!("GET {narinfo_url}"))?
            .into_string()
            .context("read narinfo")?;
        let location = nar_location(&body, drv_path)?;

        let nar_url = self.base.join(&location).context("build nar url")?;
        debug!(url = %nar_url, "fetching nar");
        let mut nar = Vec::new();
        self.agent
            .get(nar_url.as_str())
            .call()
            .with_context(|| format!("GET {nar_url}"))?
            .into_reader()
            .take(MAX_NAR_BYTES)
            .read_to_end(&mut nar)
            .context("read nar")?;

        let aterm = nar_regular_file(&nar)?;
        derivation_out_path(&aterm)
    }
}

/// Nixbase32 digest of a store path, which names its narinfo in the cache.
pub fn cache_key(store_path: &str) -> Result<String> {
    let path = StorePathRef::from_absolute_path(store_path.as_bytes())
        .map_err(|err| anyhow!("invalid store path {store_path}: {err}"))?;
    Ok(nixbase32::encode(path.digest()))
}

/// URL of the NAR described by a narinfo `body`, checked against the store
/// path that was asked for.
pub fn nar_location(body: &str, drv_path: &str) -> Result<String> {
    let narinfo = NarInfo::parse(body).map_err(|err| anyhow!("parse narinfo: {err}"))?;
    match narinfo.compression {
        None | Some("none") => {}
        Some(method) => {
            return Err(Error::UnsupportedCompression {
                compression: method.to_string(),
            }
            .into());
        }
    }
    let store_path = narinfo.store_path.to_absolute_path();
    if store_path != drv_path {
        bail!("narinfo store path {store_path} does not match {drv_path}");
    }
    Ok(narinfo.url.to_string())
}

/// Contents of a NAR whose root node is a regular file.
pub fn nar_regular_file(nar: &[u8]) -> Result<Vec<u8>> {
    let mut input = nar;
    let node = nar::reader::open(&mut input).context("open nar")?;
    let nar::reader::Node::File { mut reader, .. } = node else {
        bail!("nar root is not a regular file");
    };
    let mut contents = Vec::new();
    reader
        .read_to_end(&mut contents)
        .context("read nar file contents")?;
    Ok(contents)
}

/// Path of the `out` output of a derivation in ATerm form.
pub fn derivation_out_path(aterm: &[u8]) -> Result<String> {
    let derivation = Derivation::from_aterm_bytes(aterm)
        .map_err(|err| anyhow!("parse derivation: {err:?}"))?;
    let output = derivation
        .outputs
        .get("out")
        .ok_or_else(|| anyhow!("derivation has no out output"))?;
    let path = output
        .path
        .as_ref()
        .ok_or_else(|| anyhow!("derivation out path is not known in advance"))?;
    Ok(path.to_absolute_path())
}
