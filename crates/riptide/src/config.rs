//! Application configuration: the binary descriptor and the settings map.
//!
//! The descriptor uses the same tagged table encoding as the IPC protocol,
//! which is what makes its reserved fields skippable. Settings are a JSON
//! document; every recognised key has a typed default and unrecognised keys
//! pass through untouched.
//!
//! Store reads retry with fixed backoff; parse failures are fatal for the
//! application, never for the node.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::MetaStore;
use crate::protocol::{FrameError, TableReader, TableWriter};
use crate::retry::{retry_with_backoff, FixedBackoff};

/// Metadata-store key of an application's binary descriptor.
pub fn app_descriptor_key(app_name: &str) -> String {
    format!("apps::{app_name}")
}

/// Metadata-store key of an application's settings document.
pub fn app_settings_key(app_name: &str) -> String {
    format!("settings::{app_name}")
}

/// One bucket binding exposed to the handler under an alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBinding {
    pub bucket_name: String,
    pub alias: String,
    pub scope_name: String,
    pub collection_name: String,
}

/// One outbound curl binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurlBinding {
    pub hostname: String,
    pub value: String,
    pub auth_type: String,
    pub username: String,
    pub password: String,
    pub bearer_key: String,
    pub allow_cookies: bool,
    pub validate_ssl_certificate: bool,
}

/// One constant binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantBinding {
    pub value: String,
    pub literal: String,
}

/// Source/metadata dependencies of the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepCfg {
    pub buckets: Vec<BucketBinding>,
    pub metadata_bucket: String,
    pub source_bucket: String,
    pub source_scope: String,
    pub source_collection: String,
    pub metadata_scope: String,
    pub metadata_collection: String,
}

/// Decoded application descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppDescriptor {
    pub app_code: String,
    pub app_name: String,
    pub dep_cfg: DepCfg,
    pub handler_uuid: u32,
    pub function_instance_id: String,
    pub access: Vec<String>,
    pub curl: Vec<CurlBinding>,
    pub enforce_schema: bool,
    pub constants: Vec<ConstantBinding>,
    pub lifecycle_state: String,
    pub version: String,
}

// Descriptor table tags. 12..14 are reserved for backward compatibility and
// are tolerated (skipped) on decode.
const CFG_APP_CODE: u8 = 1;
const CFG_APP_NAME: u8 = 2;
const CFG_DEP_CFG: u8 = 3;
const CFG_HANDLER_UUID: u8 = 4;
const CFG_FUNCTION_INSTANCE_ID: u8 = 5;
const CFG_ACCESS: u8 = 6;
const CFG_CURL: u8 = 7;
const CFG_ENFORCE_SCHEMA: u8 = 8;
const CFG_CONSTANT: u8 = 9;
const CFG_LIFECYCLE_STATE: u8 = 10;
const CFG_VERSION: u8 = 11;

const DEP_BUCKET: u8 = 1;
const DEP_METADATA_BUCKET: u8 = 2;
const DEP_SOURCE_BUCKET: u8 = 3;
const DEP_SOURCE_SCOPE: u8 = 4;
const DEP_SOURCE_COLLECTION: u8 = 5;
const DEP_METADATA_SCOPE: u8 = 6;
const DEP_METADATA_COLLECTION: u8 = 7;

const BKT_BUCKET_NAME: u8 = 1;
const BKT_ALIAS: u8 = 2;
const BKT_SCOPE_NAME: u8 = 3;
const BKT_COLLECTION_NAME: u8 = 4;

const CURL_HOSTNAME: u8 = 1;
const CURL_VALUE: u8 = 2;
const CURL_AUTH_TYPE: u8 = 3;
const CURL_USERNAME: u8 = 4;
const CURL_PASSWORD: u8 = 5;
const CURL_BEARER_KEY: u8 = 6;
const CURL_ALLOW_COOKIES: u8 = 7;
const CURL_VALIDATE_SSL: u8 = 8;

const CONST_VALUE: u8 = 1;
const CONST_LITERAL: u8 = 2;

impl AppDescriptor {
    pub fn encode(&self) -> Bytes {
        let mut w = TableWriter::new();
        w.put_str(CFG_APP_CODE, &self.app_code);
        w.put_str(CFG_APP_NAME, &self.app_name);
        w.put_bytes(CFG_DEP_CFG, &encode_dep_cfg(&self.dep_cfg));
        w.put_u32(CFG_HANDLER_UUID, self.handler_uuid);
        w.put_str(CFG_FUNCTION_INSTANCE_ID, &self.function_instance_id);
        for access in &self.access {
            w.put_str(CFG_ACCESS, access);
        }
        for curl in &self.curl {
            w.put_bytes(CFG_CURL, &encode_curl(curl));
        }
        w.put_bool(CFG_ENFORCE_SCHEMA, self.enforce_schema);
        for constant in &self.constants {
            w.put_bytes(CFG_CONSTANT, &encode_constant(constant));
        }
        w.put_str(CFG_LIFECYCLE_STATE, &self.lifecycle_state);
        w.put_str(CFG_VERSION, &self.version);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut out = AppDescriptor::default();
        let mut reader = TableReader::new(buf);
        while let Some((tag, value)) = reader.next()? {
            match tag {
                CFG_APP_CODE => out.app_code = value.as_str(tag)?.to_string(),
                CFG_APP_NAME => out.app_name = value.as_str(tag)?.to_string(),
                CFG_DEP_CFG => out.dep_cfg = decode_dep_cfg(value.as_bytes(tag)?)?,
                CFG_HANDLER_UUID => out.handler_uuid = value.as_u32(tag)?,
                CFG_FUNCTION_INSTANCE_ID => {
                    out.function_instance_id = value.as_str(tag)?.to_string()
                }
                CFG_ACCESS => out.access.push(value.as_str(tag)?.to_string()),
                CFG_CURL => out.curl.push(decode_curl(value.as_bytes(tag)?)?),
                CFG_ENFORCE_SCHEMA => out.enforce_schema = value.as_bool(tag)?,
                CFG_CONSTANT => out.constants.push(decode_constant(value.as_bytes(tag)?)?),
                CFG_LIFECYCLE_STATE => out.lifecycle_state = value.as_str(tag)?.to_string(),
                CFG_VERSION => out.version = value.as_str(tag)?.to_string(),
                // Reserved and future fields.
                _ => {}
            }
        }
        Ok(out)
    }
}

fn encode_dep_cfg(dep: &DepCfg) -> Bytes {
    let mut w = TableWriter::new();
    for bucket in &dep.buckets {
        w.put_bytes(DEP_BUCKET, &encode_bucket(bucket));
    }
    w.put_str(DEP_METADATA_BUCKET, &dep.metadata_bucket);
    w.put_str(DEP_SOURCE_BUCKET, &dep.source_bucket);
    w.put_str(DEP_SOURCE_SCOPE, &dep.source_scope);
    w.put_str(DEP_SOURCE_COLLECTION, &dep.source_collection);
    w.put_str(DEP_METADATA_SCOPE, &dep.metadata_scope);
    w.put_str(DEP_METADATA_COLLECTION, &dep.metadata_collection);
    w.finish()
}

fn decode_dep_cfg(buf: &[u8]) -> Result<DepCfg, FrameError> {
    let mut out = DepCfg::default();
    let mut reader = TableReader::new(buf);
    while let Some((tag, value)) = reader.next()? {
        match tag {
            DEP_BUCKET => out.buckets.push(decode_bucket(value.as_bytes(tag)?)?),
            DEP_METADATA_BUCKET => out.metadata_bucket = value.as_str(tag)?.to_string(),
            DEP_SOURCE_BUCKET => out.source_bucket = value.as_str(tag)?.to_string(),
            DEP_SOURCE_SCOPE => out.source_scope = value.as_str(tag)?.to_string(),
            DEP_SOURCE_COLLECTION => out.source_collection = value.as_str(tag)?.to_string(),
            DEP_METADATA_SCOPE => out.metadata_scope = value.as_str(tag)?.to_string(),
            DEP_METADATA_COLLECTION => out.metadata_collection = value.as_str(tag)?.to_string(),
            _ => {}
        }
    }
    Ok(out)
}

fn encode_bucket(bucket: &BucketBinding) -> Bytes {
    let mut w = TableWriter::new();
    w.put_str(BKT_BUCKET_NAME, &bucket.bucket_name);
    w.put_str(BKT_ALIAS, &bucket.alias);
    w.put_str(BKT_SCOPE_NAME, &bucket.scope_name);
    w.put_str(BKT_COLLECTION_NAME, &bucket.collection_name);
    w.finish()
}

fn decode_bucket(buf: &[u8]) -> Result<BucketBinding, FrameError> {
    let mut out = BucketBinding::default();
    let mut reader = TableReader::new(buf);
    while let Some((tag, value)) = reader.next()? {
        match tag {
            BKT_BUCKET_NAME => out.bucket_name = value.as_str(tag)?.to_string(),
            BKT_ALIAS => out.alias = value.as_str(tag)?.to_string(),
            BKT_SCOPE_NAME => out.scope_name = value.as_str(tag)?.to_string(),
            BKT_COLLECTION_NAME => out.collection_name = value.as_str(tag)?.to_string(),
            _ => {}
        }
    }
    Ok(out)
}

fn encode_curl(curl: &CurlBinding) -> Bytes {
    let mut w = TableWriter::new();
    w.put_str(CURL_HOSTNAME, &curl.hostname);
    w.put_str(CURL_VALUE, &curl.value);
    w.put_str(CURL_AUTH_TYPE, &curl.auth_type);
    w.put_str(CURL_USERNAME, &curl.username);
    w.put_str(CURL_PASSWORD, &curl.password);
    w.put_str(CURL_BEARER_KEY, &curl.bearer_key);
    w.put_bool(CURL_ALLOW_COOKIES, curl.allow_cookies);
    w.put_bool(CURL_VALIDATE_SSL, curl.validate_ssl_certificate);
    w.finish()
}

fn decode_curl(buf: &[u8]) -> Result<CurlBinding, FrameError> {
    let mut out = CurlBinding::default();
    let mut reader = TableReader::new(buf);
    while let Some((tag, value)) = reader.next()? {
        match tag {
            CURL_HOSTNAME => out.hostname = value.as_str(tag)?.to_string(),
            CURL_VALUE => out.value = value.as_str(tag)?.to_string(),
            CURL_AUTH_TYPE => out.auth_type = value.as_str(tag)?.to_string(),
            CURL_USERNAME => out.username = value.as_str(tag)?.to_string(),
            CURL_PASSWORD => out.password = value.as_str(tag)?.to_string(),
            CURL_BEARER_KEY => out.bearer_key = value.as_str(tag)?.to_string(),
            CURL_ALLOW_COOKIES => out.allow_cookies = value.as_bool(tag)?,
            CURL_VALIDATE_SSL => out.validate_ssl_certificate = value.as_bool(tag)?,
            _ => {}
        }
    }
    Ok(out)
}

fn encode_constant(constant: &ConstantBinding) -> Bytes {
    let mut w = TableWriter::new();
    w.put_str(CONST_VALUE, &constant.value);
    w.put_str(CONST_LITERAL, &constant.literal);
    w.finish()
}

fn decode_constant(buf: &[u8]) -> Result<ConstantBinding, FrameError> {
    let mut out = ConstantBinding::default();
    let mut reader = TableReader::new(buf);
    while let Some((tag, value)) = reader.next()? {
        match tag {
            CONST_VALUE => out.value = value.as_str(tag)?.to_string(),
            CONST_LITERAL => out.literal = value.as_str(tag)?.to_string(),
            _ => {}
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Where a freshly owned vbucket's CDC stream starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamBoundary {
    /// Replay from the beginning of history.
    #[default]
    Everything,
    /// Only mutations after stream open.
    FromNow,
}

impl StreamBoundary {
    fn parse(raw: &str) -> Self {
        match raw {
            "from_now" => StreamBoundary::FromNow,
            _ => StreamBoundary::Everything,
        }
    }
}

/// Typed application settings with their defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub worker_count: usize,
    pub timer_worker_pool_size: usize,
    pub lcb_inst_capacity: i32,
    pub execution_timeout: Duration,
    pub curl_timeout: Duration,
    pub sock_batch_size: usize,
    pub vb_ownership_giveup_routine_count: usize,
    pub vb_ownership_takeover_routine_count: usize,
    pub log_level: String,
    pub tick_duration: Duration,
    pub dcp_stream_boundary: StreamBoundary,
    pub worker_queue_cap: usize,
    pub app_log_max_size: u64,
    pub app_log_max_files: usize,
    pub enable_recursive_mutation: bool,
    pub cleanup_timers: bool,
    pub skip_timer_threshold: u64,
    pub rbac_user: String,
    pub rbac_pass: String,
    pub deadline_timeout: Duration,
    pub fuzz_offset: i32,
    pub cpp_worker_thread_count: usize,
    pub checkpoint_interval: Duration,
    pub xattr_entry_prune_threshold: usize,
}

fn get_u64(map: &serde_json::Map<String, Value>, key: &str, default: u64) -> u64 {
    map.get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .unwrap_or(default)
}

fn get_usize(map: &serde_json::Map<String, Value>, key: &str, default: usize) -> usize {
    get_u64(map, key, default as u64) as usize
}

fn get_bool(map: &serde_json::Map<String, Value>, key: &str, default: bool) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_str<'a>(map: &'a serde_json::Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or(default)
}

impl AppSettings {
    /// Apply typed defaults over a raw settings document. Fails only on the
    /// required credentials and a zero worker count.
    pub fn from_map(map: &serde_json::Map<String, Value>) -> anyhow::Result<Self> {
        let rbac_user = map
            .get("rbacuser")
            .and_then(Value::as_str)
            .context("rbac username missing from settings")?
            .to_string();
        let rbac_pass = map
            .get("rbacpass")
            .and_then(Value::as_str)
            .context("rbac password missing from settings")?
            .to_string();

        let worker_count = get_usize(map, "worker_count", 3);
        anyhow::ensure!(worker_count > 0, "unexpected worker count {worker_count}");

        Ok(Self {
            worker_count,
            timer_worker_pool_size: get_usize(map, "timer_worker_pool_size", 3),
            lcb_inst_capacity: get_u64(map, "lcb_inst_capacity", 5) as i32,
            execution_timeout: Duration::from_secs(get_u64(map, "execution_timeout", 1)),
            curl_timeout: Duration::from_millis(get_u64(map, "curl_timeout", 500)),
            sock_batch_size: get_usize(map, "sock_batch_size", 100),
            vb_ownership_giveup_routine_count: get_usize(
                map,
                "vb_ownership_giveup_routine_count",
                3,
            ),
            vb_ownership_takeover_routine_count: get_usize(
                map,
                "vb_ownership_takeover_routine_count",
                3,
            ),
            log_level: get_str(map, "log_level", "INFO").to_string(),
            tick_duration: Duration::from_millis(get_u64(map, "tick_duration", 5000)),
            dcp_stream_boundary: StreamBoundary::parse(get_str(
                map,
                "dcp_stream_boundary",
                "everything",
            )),
            worker_queue_cap: get_usize(map, "worker_queue_cap", 1_000_000),
            app_log_max_size: get_u64(map, "app_log_max_size", 10 * 1024 * 1024),
            app_log_max_files: get_usize(map, "app_log_max_files", 10),
            enable_recursive_mutation: get_bool(map, "enable_recursive_mutation", false),
            cleanup_timers: get_bool(map, "cleanup_timers", false),
            skip_timer_threshold: get_u64(map, "skip_timer_threshold", 86_400),
            rbac_user,
            rbac_pass,
            deadline_timeout: Duration::from_secs(get_u64(map, "deadline_timeout", 2)),
            fuzz_offset: get_u64(map, "fuzz_offset", 30) as i32,
            cpp_worker_thread_count: get_usize(map, "cpp_worker_thread_count", 1),
            checkpoint_interval: Duration::from_millis(get_u64(map, "checkpoint_interval", 10_000)),
            xattr_entry_prune_threshold: get_usize(
                map,
                "xattr_doc_timer_entry_prune_threshold",
                100,
            ),
        })
    }
}

/// Immutable per-application configuration: descriptor plus settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub app_code: String,
    pub handler_uuid: u32,
    pub function_instance_id: String,
    pub dep_cfg: DepCfg,
    pub access: Vec<String>,
    pub curl: Vec<CurlBinding>,
    pub constants: Vec<ConstantBinding>,
    pub settings: AppSettings,
    /// Raw settings document; unrecognised keys ride along unchanged.
    pub raw_settings: serde_json::Map<String, Value>,
}

impl AppConfig {
    /// Dependency config rendered for the engine init payload.
    pub fn depcfg_json(&self) -> String {
        serde_json::to_string(&self.dep_cfg).unwrap_or_default()
    }
}

/// Load an application's descriptor and settings from the metadata store.
///
/// Store reads retry with `backoff` until `cancel` fires; a missing or
/// malformed descriptor/settings document is fatal for this application.
pub async fn load_app_config(
    store: &dyn MetaStore,
    app_name: &str,
    backoff: FixedBackoff,
    cancel: &CancellationToken,
) -> anyhow::Result<AppConfig> {
    let descriptor_key = app_descriptor_key(app_name);
    let raw_descriptor = retry_with_backoff(backoff, cancel, "get app descriptor", || async {
        store.get(&descriptor_key).await
    })
    .await?
    .with_context(|| format!("no descriptor stored for app {app_name}"))?
    .0;

    let descriptor = AppDescriptor::decode(&raw_descriptor)
        .with_context(|| format!("malformed descriptor for app {app_name}"))?;

    let settings_key = app_settings_key(app_name);
    let raw_settings = retry_with_backoff(backoff, cancel, "get app settings", || async {
        store.get(&settings_key).await
    })
    .await?
    .with_context(|| format!("no settings stored for app {app_name}"))?
    .0;

    let settings_doc: Value = serde_json::from_slice(&raw_settings)
        .with_context(|| format!("malformed settings for app {app_name}"))?;
    let map = settings_doc
        .as_object()
        .with_context(|| format!("settings for app {app_name} are not a JSON object"))?
        .clone();
    let settings = AppSettings::from_map(&map)
        .with_context(|| format!("invalid settings for app {app_name}"))?;

    tracing::info!(
        app = app_name,
        worker_count = settings.worker_count,
        source_bucket = %descriptor.dep_cfg.source_bucket,
        tick_ms = settings.tick_duration.as_millis() as u64,
        "loaded app config"
    );

    Ok(AppConfig {
        app_name: descriptor.app_name,
        app_code: descriptor.app_code,
        handler_uuid: descriptor.handler_uuid,
        function_instance_id: descriptor.function_instance_id,
        dep_cfg: descriptor.dep_cfg,
        access: descriptor.access,
        curl: descriptor.curl,
        constants: descriptor.constants,
        settings,
        raw_settings: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryMetaStore;

    fn sample_descriptor() -> AppDescriptor {
        AppDescriptor {
            app_code: "function OnUpdate(doc, meta) {}".into(),
            app_name: "app1".into(),
            dep_cfg: DepCfg {
                buckets: vec![BucketBinding {
                    bucket_name: "travel".into(),
                    alias: "src".into(),
                    scope_name: "_default".into(),
                    collection_name: "_default".into(),
                }],
                metadata_bucket: "eventing-meta".into(),
                source_bucket: "travel".into(),
                source_scope: "_default".into(),
                source_collection: "_default".into(),
                metadata_scope: "_default".into(),
                metadata_collection: "_default".into(),
            },
            handler_uuid: 0xFEED_BEEF,
            function_instance_id: "inst-01".into(),
            access: vec!["rw".into()],
            curl: vec![CurlBinding {
                hostname: "https://example.com".into(),
                value: "api".into(),
                auth_type: "basic".into(),
                username: "u".into(),
                password: "p".into(),
                bearer_key: String::new(),
                allow_cookies: true,
                validate_ssl_certificate: true,
            }],
            enforce_schema: false,
            constants: vec![ConstantBinding {
                value: "limit".into(),
                literal: "10".into(),
            }],
            lifecycle_state: "deployed".into(),
            version: "evt-1.0".into(),
        }
    }

    fn settings_json() -> Value {
        serde_json::json!({
            "rbacuser": "admin",
            "rbacpass": "secret",
            "worker_count": 2,
            "tick_duration": 100.0,
            "custom_future_knob": {"nested": true}
        })
    }

    #[test]
    fn descriptor_round_trips() {
        let descriptor = sample_descriptor();
        let decoded = AppDescriptor::decode(&descriptor.encode()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn reserved_descriptor_fields_are_ignored() {
        let descriptor = sample_descriptor();
        let mut w = TableWriter::new();
        w.put_str(CFG_APP_NAME, &descriptor.app_name);
        // Reserved slots written by an older/newer producer.
        w.put_str(12, "reserved1");
        w.put_i32(13, -1);
        w.put_bool(14, true);
        w.put_str(CFG_VERSION, &descriptor.version);
        let decoded = AppDescriptor::decode(&w.finish()).unwrap();
        assert_eq!(decoded.app_name, "app1");
        assert_eq!(decoded.version, "evt-1.0");
    }

    #[test]
    fn settings_defaults_apply() {
        let map = settings_json().as_object().unwrap().clone();
        let settings = AppSettings::from_map(&map).unwrap();
        assert_eq!(settings.worker_count, 2);
        assert_eq!(settings.tick_duration, Duration::from_millis(100));
        // Untouched knobs keep their defaults.
        assert_eq!(settings.lcb_inst_capacity, 5);
        assert_eq!(settings.execution_timeout, Duration::from_secs(1));
        assert_eq!(settings.curl_timeout, Duration::from_millis(500));
        assert_eq!(settings.worker_queue_cap, 1_000_000);
        assert_eq!(settings.app_log_max_size, 10 * 1024 * 1024);
        assert_eq!(settings.skip_timer_threshold, 86_400);
        assert_eq!(settings.dcp_stream_boundary, StreamBoundary::Everything);
        assert!(!settings.enable_recursive_mutation);
    }

    #[test]
    fn missing_credentials_fail_loading() {
        let map = serde_json::json!({"worker_count": 3})
            .as_object()
            .unwrap()
            .clone();
        assert!(AppSettings::from_map(&map).is_err());
    }

    #[test]
    fn zero_worker_count_fails_loading() {
        let map = serde_json::json!({
            "rbacuser": "a", "rbacpass": "b", "worker_count": 0
        })
        .as_object()
        .unwrap()
        .clone();
        assert!(AppSettings::from_map(&map).is_err());
    }

    #[tokio::test]
    async fn load_from_store_preserves_unknown_settings() {
        let store = MemoryMetaStore::new();
        store.put_raw(
            &app_descriptor_key("app1"),
            sample_descriptor().encode(),
        );
        store.put_raw(
            &app_settings_key("app1"),
            Bytes::from(serde_json::to_vec(&settings_json()).unwrap()),
        );

        let cancel = CancellationToken::new();
        let cfg = load_app_config(
            &store,
            "app1",
            FixedBackoff::new(Duration::from_millis(1)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(cfg.app_name, "app1");
        assert_eq!(cfg.settings.worker_count, 2);
        assert!(cfg.raw_settings.contains_key("custom_future_knob"));
        assert!(cfg.depcfg_json().contains("eventing-meta"));
    }

    #[tokio::test]
    async fn malformed_descriptor_is_fatal_for_the_app() {
        let store = MemoryMetaStore::new();
        // A bytes field with a length running past the buffer.
        store.put_raw(
            &app_descriptor_key("bad"),
            Bytes::from_static(&[CFG_APP_NAME, 4, 255, 0, 0, 0]),
        );
        store.put_raw(
            &app_settings_key("bad"),
            Bytes::from_static(b"{\"rbacuser\":\"a\",\"rbacpass\":\"b\"}"),
        );

        let cancel = CancellationToken::new();
        let res = load_app_config(
            &store,
            "bad",
            FixedBackoff::new(Duration::from_millis(1)),
            &cancel,
        )
        .await;
        assert!(res.is_err());
    }
}
