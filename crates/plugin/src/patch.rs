//! Genesis parameter patching.
//!
//! Operates on the genesis document as JSON. Values are written through fixed
//! paths; serialization goes through `serde_json`'s map type, which orders
//! keys, so patched output is canonical bytes for a given input.

use std::time::Duration;

use serde_json::Value;

/// Parameters rewritten into a forked genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenesisPatch {
    /// New `chain_id`. Empty means keep the source chain id.
    pub chain_id: String,
    /// New governance voting period.
    pub voting_period: Option<Duration>,
    /// New staking unbonding time.
    pub unbonding_time: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("genesis is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("genesis has no object at {0}")]
    NotAnObject(&'static str),
}

fn seconds_str(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

fn object_at<'a>(
    root: &'a mut Value,
    path: &[&str],
    label: &'static str,
) -> Result<Option<&'a mut serde_json::Map<String, Value>>, PatchError> {
    let mut cur = root;
    for key in path {
        match cur.get_mut(*key) {
            Some(next) => cur = next,
            None => return Ok(None),
        }
    }
    match cur.as_object_mut() {
        Some(obj) => Ok(Some(obj)),
        None => Err(PatchError::NotAnObject(label)),
    }
}

/// Applies `opts` to raw genesis bytes.
///
/// The governance voting period is written both to the current SDK location
/// (`app_state.gov.params.voting_period`) and the pre-v47 one
/// (`app_state.gov.voting_params.voting_period`) when present. Fields absent
/// from the source document are left absent rather than invented.
pub fn patch_genesis(raw: &[u8], opts: &GenesisPatch) -> Result<Vec<u8>, PatchError> {
    let mut genesis: Value = serde_json::from_slice(raw)?;

    if !opts.chain_id.is_empty() {
        if let Some(root) = genesis.as_object_mut() {
            root.insert("chain_id".to_string(), Value::String(opts.chain_id.clone()));
        } else {
            return Err(PatchError::NotAnObject("genesis root"));
        }
    }

    if let Some(period) = opts.voting_period {
        let value = Value::String(seconds_str(period));
        for (path, label) in [
            (&["app_state", "gov", "params"][..], "app_state.gov.params"),
            (&["app_state", "gov", "voting_params"][..], "app_state.gov.voting_params"),
        ] {
            if let Some(obj) = object_at(&mut genesis, path, label)? {
                if obj.contains_key("voting_period") {
                    obj.insert("voting_period".to_string(), value.clone());
                }
            }
        }
    }

    if let Some(unbonding) = opts.unbonding_time {
        if let Some(obj) =
            object_at(&mut genesis, &["app_state", "staking", "params"], "app_state.staking.params")?
        {
            if obj.contains_key("unbonding_time") {
                obj.insert("unbonding_time".to_string(), Value::String(seconds_str(unbonding)));
            }
        }
    }

    Ok(serde_json::to_vec_pretty(&genesis)?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample_genesis() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "chain_id": "mainnet-1",
            "genesis_time": "2023-01-01T00:00:00Z",
            "app_state": {
                "gov": { "params": { "voting_period": "172800s" } },
                "staking": { "params": { "unbonding_time": "1814400s" } },
            },
        }))
        .unwrap()
    }

    fn full_patch() -> GenesisPatch {
        GenesisPatch {
            chain_id: "x-1".into(),
            voting_period: Some(Duration::from_secs(30)),
            unbonding_time: Some(Duration::from_secs(60)),
        }
    }

    #[test]
    fn rewrites_all_requested_fields() {
        let patched = patch_genesis(&sample_genesis(), &full_patch()).unwrap();
        let value: Value = serde_json::from_slice(&patched).unwrap();

        assert_eq!(value["chain_id"], "x-1");
        assert_eq!(value["app_state"]["gov"]["params"]["voting_period"], "30s");
        assert_eq!(value["app_state"]["staking"]["params"]["unbonding_time"], "60s");
    }

    #[test]
    fn patch_is_idempotent() {
        let opts = full_patch();
        let once = patch_genesis(&sample_genesis(), &opts).unwrap();
        let twice = patch_genesis(&once, &opts).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn legacy_gov_location_is_honored() {
        let raw = serde_json::to_vec(&json!({
            "chain_id": "old-1",
            "app_state": { "gov": { "voting_params": { "voting_period": "172800s" } } },
        }))
        .unwrap();

        let patched = patch_genesis(&raw, &full_patch()).unwrap();
        let value: Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["app_state"]["gov"]["voting_params"]["voting_period"], "30s");
    }

    #[test]
    fn absent_fields_are_not_invented() {
        let raw = serde_json::to_vec(&json!({ "chain_id": "bare-1", "app_state": {} })).unwrap();
        let patched = patch_genesis(&raw, &full_patch()).unwrap();
        let value: Value = serde_json::from_slice(&patched).unwrap();

        assert_eq!(value["chain_id"], "x-1");
        assert!(value["app_state"].get("gov").is_none());
        assert!(value["app_state"].get("staking").is_none());
    }

    #[test]
    fn empty_chain_id_keeps_source() {
        let opts = GenesisPatch { chain_id: String::new(), ..full_patch() };
        let patched = patch_genesis(&sample_genesis(), &opts).unwrap();
        let value: Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["chain_id"], "mainnet-1");
    }
}
