use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::warn;

use crate::conv::backward_data::policy::AlgoPolicy;

const CONV_BWD_DATA_ALGO: &str = "DNNRS_CONV_BWD_DATA_ALGO";
const ALGO_CACHE: &str = "DNNRS_ALGO_CACHE";
const CUDA_SYNC_LAUNCH: &str = "DNNRS_CUDA_SYNC_LAUNCH";
const CUDA_KERNEL_MANIFEST: &str = "DNNRS_CUDA_KERNEL_MANIFEST";

static BWD_DATA_POLICY: OnceLock<Option<AlgoPolicy>> = OnceLock::new();
static ALGO_CACHE_ENABLED: OnceLock<bool> = OnceLock::new();
static CUDA_SYNC_LAUNCH_ENABLED: OnceLock<bool> = OnceLock::new();

pub fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Policy override for backward-data algorithm selection, read once.
///
/// Unparseable values are logged and ignored.
pub fn conv_bwd_data_policy() -> Option<AlgoPolicy> {
    BWD_DATA_POLICY
        .get_or_init(|| match env::var(CONV_BWD_DATA_ALGO) {
            Ok(value) if !value.trim().is_empty() => match AlgoPolicy::parse(&value) {
                Ok(policy) => Some(policy),
                Err(err) => {
                    warn!(%err, "ignoring {CONV_BWD_DATA_ALGO}={value}");
                    None
                }
            },
            _ => None,
        })
        .clone()
}

fn read_flag(cell: &OnceLock<bool>, name: &str, default: bool) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value).unwrap_or_else(|| {
            warn!("ignoring {name}={value}: expected a boolean");
            default
        }),
        _ => default,
    })
}

/// Whether heuristic choices may be cached, read once. Defaults to `true`.
pub fn algo_cache_enabled() -> bool {
    read_flag(&ALGO_CACHE_ENABLED, ALGO_CACHE, true)
}

/// Whether the CUDA backend synchronizes its stream after every launch. Defaults to `false`.
pub fn cuda_sync_launch() -> bool {
    read_flag(&CUDA_SYNC_LAUNCH_ENABLED, CUDA_SYNC_LAUNCH, false)
}

/// Location of the CUDA kernel manifest, if configured.
pub fn cuda_kernel_manifest() -> Option<PathBuf> {
    env::var_os(CUDA_KERNEL_MANIFEST)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
