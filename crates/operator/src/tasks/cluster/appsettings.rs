//! Per-component `appsettings.Production.json` documents.
//!
//! Each document is built from fixed per-component defaults plus whatever
//! global settings the cluster supplies, then the component's override
//! document is applied with a single top-level key replacement pass.

use super::naming::{ComponentKind, ResourceNaming};
use crate::crds::{GlobalConfig, HonseFarmClusterSpec, ShardSpec};
use crate::tasks::types::Result;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub type Document = Map<String, Value>;

const SERVER_DB_POOL_SIZE: i64 = 2000;
const SERVER_METRICS_PORT: i64 = 4981;
const SERVER_SHARD_NAME: &str = "main-server";
const ADMIN_CONFIG_FILES_PATH: &str = "/app/config";
const FILESERVER_SERVER_ID: &str = "Forest";
const FILESERVER_CACHE_DIRECTORY: &str = "/cache";
const FILESERVER_DOWNLOAD_QUEUE_SIZE: i64 = 100;
const FILESERVER_DOWNLOAD_QUEUE_RELEASE_SECONDS: i64 = 300;
const FILESERVER_DB_POOL_SIZE: i64 = 512;
const MAIN_SERVER_ADDRESS: &str = "http://server:5000";
const MAIN_FILESERVER_ADDRESS: &str = "http://main-fileserver:5001";
const MAIN_CACHE_LIMIT_GIB: i64 = 10;
const MAIN_METRICS_PORT: i64 = 4982;
const SHARD_CACHE_LIMIT_GIB: i64 = 100;
const SHARD_COLD_STORAGE_RETENTION_DAYS: i64 = 90;
const SHARD_UNUSED_FILE_RETENTION_DAYS: i64 = 7;
const SHARD_METRICS_PORT: i64 = 4983;

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Render the document for one component (or one shard).
pub fn render(
    spec: &HonseFarmClusterSpec,
    kind: ComponentKind,
    shard: Option<&ShardSpec>,
) -> Document {
    let mut doc = match (kind, shard) {
        (ComponentKind::Server, _) => server_document(spec),
        (ComponentKind::AdminPanel, _) => admin_document(spec),
        (ComponentKind::MainFileserver, _) => main_fileserver_document(spec),
        (ComponentKind::ShardFileserver, shard) => {
            let name = shard.map_or("", |s| s.name.as_str());
            shard_fileserver_document(spec, name)
        }
    };

    if let Some(override_doc) = override_for(spec, kind, shard) {
        merge_override(&mut doc, override_doc);
    }

    doc
}

/// Replace top-level keys of `base` with those of `override_doc`.
///
/// Nested objects are replaced wholesale, never merged. Anything other than
/// a JSON object is ignored and `base` is left untouched. Returns whether the
/// override was applied.
pub fn merge_override(base: &mut Document, override_doc: &Value) -> bool {
    let Value::Object(overrides) = override_doc else {
        return false;
    };
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
    true
}

/// Collect one compact JSON document per enabled component into bundle
/// entries keyed `<component>.appsettings.Production.json`.
pub fn build_config_bundle(spec: &HonseFarmClusterSpec) -> Result<BTreeMap<String, String>> {
    let mut bundle = BTreeMap::new();
    let Some(components) = spec.components.as_ref() else {
        return Ok(bundle);
    };

    let mut push = |kind: ComponentKind, shard: Option<&ShardSpec>| -> Result<()> {
        let doc = render(spec, kind, shard);
        let key = ResourceNaming::appsettings_key(kind, shard.map(|s| s.name.as_str()));
        bundle.insert(key, serde_json::to_string(&doc)?);
        Ok(())
    };

    if components.server.is_some() {
        push(ComponentKind::Server, None)?;
    }
    if components.admin_panel.is_some() {
        push(ComponentKind::AdminPanel, None)?;
    }
    if let Some(fileservers) = components.fileservers.as_ref() {
        if fileservers.main.is_some() {
            push(ComponentKind::MainFileserver, None)?;
        }
        for shard in &fileservers.shards {
            push(ComponentKind::ShardFileserver, Some(shard))?;
        }
    }

    Ok(bundle)
}

fn override_for<'a>(
    spec: &'a HonseFarmClusterSpec,
    kind: ComponentKind,
    shard: Option<&'a ShardSpec>,
) -> Option<&'a Value> {
    let components = spec.components.as_ref()?;
    match kind {
        ComponentKind::Server => components.server.as_ref()?.config_overrides.as_ref(),
        ComponentKind::AdminPanel => components.admin_panel.as_ref()?.config_overrides.as_ref(),
        ComponentKind::MainFileserver => components
            .fileservers
            .as_ref()?
            .main
            .as_ref()?
            .config_overrides
            .as_ref(),
        ComponentKind::ShardFileserver => shard?.config_overrides.as_ref(),
    }
}

/// Which global log levels a component's `Logging.LogLevel` section carries
enum LogLevelKeys {
    /// `Default`, `Microsoft`, `MicrosoftHostingLifetime`
    Server,
    /// `Default`, `MicrosoftAspNetCore`
    Admin,
    /// `Default`, `Microsoft`
    Fileserver,
}

fn insert_logging(doc: &mut Document, global: Option<&GlobalConfig>, keys: &LogLevelKeys) {
    let Some(logging) = global.and_then(|g| g.logging.as_ref()) else {
        return;
    };

    let mut levels = Map::new();
    if let Some(level) = non_empty(logging.default_level.as_ref()) {
        levels.insert("Default".into(), json!(level));
    }
    if matches!(keys, LogLevelKeys::Server | LogLevelKeys::Fileserver) {
        if let Some(level) = non_empty(logging.microsoft_level.as_ref()) {
            levels.insert("Microsoft".into(), json!(level));
        }
    }
    if let Some(level) = non_empty(logging.asp_net_core_level.as_ref()) {
        match keys {
            LogLevelKeys::Server => {
                levels.insert("MicrosoftHostingLifetime".into(), json!(level));
            }
            LogLevelKeys::Admin => {
                levels.insert("MicrosoftAspNetCore".into(), json!(level));
            }
            LogLevelKeys::Fileserver => {}
        }
    }

    if !levels.is_empty() {
        doc.insert("Logging".into(), json!({ "LogLevel": levels }));
    }
}

fn insert_connection_strings(doc: &mut Document, global: Option<&GlobalConfig>) {
    if let Some(db) = global.and_then(|g| g.database.as_ref()) {
        let conn = format!(
            "Host={};Database={};Username={};Password={}",
            db.host, db.name, db.username, db.password
        );
        doc.insert("ConnectionStrings".into(), json!({ "Database": conn }));
    }
}

fn kestrel(url: &str) -> Value {
    json!({ "Endpoints": { "Http": { "Url": url } } })
}

/// `Jwt` and Redis entries; `with_pool` adds `RedisPool` when non-zero
fn insert_jwt_and_redis(hf: &mut Document, global: Option<&GlobalConfig>, with_pool: bool) {
    let Some(global) = global else {
        return;
    };
    if let Some(secret) = non_empty(global.jwt.as_ref().and_then(|j| j.secret.as_ref())) {
        hf.insert("Jwt".into(), json!(secret));
    }
    if let Some(redis) = global.redis.as_ref() {
        hf.insert(
            "RedisConnectionString".into(),
            json!(redis.connection_string),
        );
        if with_pool && redis.pool != 0 {
            hf.insert("RedisPool".into(), json!(redis.pool));
        }
    }
}

fn insert_telemetry(hf: &mut Document, global: Option<&GlobalConfig>) {
    let Some(telemetry) = global.and_then(|g| g.telemetry.as_ref()) else {
        return;
    };
    if let Some(endpoint) = non_empty(telemetry.logs_endpoint.as_ref()) {
        hf.insert("OpenTelemetryLogsEndpoint".into(), json!(endpoint));
    }
    hf.insert(
        "OpenTelemetryAnalyticsOptIn".into(),
        json!(telemetry.analytics_opt_in),
    );
    if let Some(conn) = non_empty(telemetry.analytics_connection_string.as_ref()) {
        hf.insert("OpenTelemetryAnalyticsConnectionString".into(), json!(conn));
    }
}

fn insert_federation(doc: &mut Document, global: Option<&GlobalConfig>) {
    let Some(f) = global.and_then(|g| g.federation.as_ref()) else {
        return;
    };

    let mut fed = Map::new();
    let optional = [
        ("ServerId", &f.server_id),
        ("ServerName", &f.server_name),
        ("ServerDescription", &f.server_description),
        ("ServerVersion", &f.server_version),
        ("ServerLocation", &f.server_location),
        ("ServerDiscordLink", &f.server_discord_link),
        ("ServerType", &f.server_type),
        ("ServerJoinSecret", &f.server_join_secret),
        ("ServerBaseUrl", &f.server_base_url),
        ("DnsBootstrapHostname", &f.dns_bootstrap_hostname),
        ("GroupUidPrefix", &f.group_uid_prefix),
        ("Role", &f.role),
    ];
    for (key, value) in optional {
        if let Some(value) = non_empty(value.as_ref()) {
            fed.insert(key.into(), json!(value));
        }
    }
    fed.insert("UseDnsBootstrap".into(), json!(f.use_dns_bootstrap));

    doc.insert("Federation".into(), Value::Object(fed));
}

fn cdn_host(spec: &HonseFarmClusterSpec) -> Option<&str> {
    non_empty(spec.hosts.as_ref().and_then(|h| h.cdn.as_ref()))
}

fn server_document(spec: &HonseFarmClusterSpec) -> Document {
    let global = spec.global.as_ref();
    let mut doc = Document::new();

    insert_logging(&mut doc, global, &LogLevelKeys::Server);
    insert_connection_strings(&mut doc, global);
    doc.insert("AllowedHosts".into(), json!("*"));
    insert_federation(&mut doc, global);

    let mut hf = Document::new();
    insert_jwt_and_redis(&mut hf, global, true);
    insert_telemetry(&mut hf, global);
    hf.insert("DbContextPoolSize".into(), json!(SERVER_DB_POOL_SIZE));
    hf.insert("MetricsPort".into(), json!(SERVER_METRICS_PORT));
    hf.insert("ShardName".into(), json!(SERVER_SHARD_NAME));
    if let Some(cdn) = cdn_host(spec) {
        hf.insert("CdnFullUrl".into(), json!(format!("https://{cdn}/")));
    }
    doc.insert("HonseFarm".into(), Value::Object(hf));

    doc.insert("Kestrel".into(), kestrel("http://*:5000"));
    doc
}

fn admin_document(spec: &HonseFarmClusterSpec) -> Document {
    let global = spec.global.as_ref();
    let mut doc = Document::new();

    insert_logging(&mut doc, global, &LogLevelKeys::Admin);
    insert_connection_strings(&mut doc, global);

    let mut hf = Document::new();
    insert_jwt_and_redis(&mut hf, global, true);
    if let Some(server) = non_empty(spec.hosts.as_ref().and_then(|h| h.server.as_ref())) {
        hf.insert("MainServerUrl".into(), json!(format!("https://{server}")));
    }
    hf.insert("ConfigFilesPath".into(), json!(ADMIN_CONFIG_FILES_PATH));
    doc.insert("HonseFarm".into(), Value::Object(hf));

    doc.insert("AllowedHosts".into(), json!("*"));
    doc
}

/// Sections shared by the main file server and every shard
fn fileserver_base(spec: &HonseFarmClusterSpec, role: &str) -> (Document, Document) {
    let global = spec.global.as_ref();
    let mut doc = Document::new();

    insert_logging(&mut doc, global, &LogLevelKeys::Fileserver);
    insert_connection_strings(&mut doc, global);

    let mut hf = Document::new();
    insert_jwt_and_redis(&mut hf, global, false);
    insert_telemetry(&mut hf, global);
    hf.insert("FileServerRole".into(), json!(role));
    hf.insert("ServerId".into(), json!(FILESERVER_SERVER_ID));

    (doc, hf)
}

fn main_fileserver_document(spec: &HonseFarmClusterSpec) -> Document {
    let (mut doc, mut hf) = fileserver_base(spec, "Main");

    if let Some(cdn) = cdn_host(spec) {
        hf.insert("FileServerName".into(), json!(cdn));
        hf.insert("ServerUri".into(), json!(format!("https://{cdn}")));
        hf.insert("CdnFullUrl".into(), json!(format!("https://{cdn}")));
    }
    hf.insert("CacheDirectory".into(), json!(FILESERVER_CACHE_DIRECTORY));
    hf.insert("CacheSizeHardLimitInGiB".into(), json!(MAIN_CACHE_LIMIT_GIB));
    hf.insert("UseColdStorage".into(), json!(false));
    hf.insert(
        "DownloadQueueSize".into(),
        json!(FILESERVER_DOWNLOAD_QUEUE_SIZE),
    );
    hf.insert(
        "DownloadQueueReleaseSeconds".into(),
        json!(FILESERVER_DOWNLOAD_QUEUE_RELEASE_SECONDS),
    );
    hf.insert("DbContextPoolSize".into(), json!(FILESERVER_DB_POOL_SIZE));
    hf.insert("MainServerAddress".into(), json!(MAIN_SERVER_ADDRESS));
    hf.insert("MetricsPort".into(), json!(MAIN_METRICS_PORT));
    doc.insert("HonseFarm".into(), Value::Object(hf));

    doc.insert("Kestrel".into(), kestrel("http://*:5001"));
    doc
}

/// Public host of a shard from `hosts.shards`, else the shard name itself
fn shard_host<'a>(spec: &'a HonseFarmClusterSpec, shard_name: &'a str) -> &'a str {
    spec.hosts
        .as_ref()
        .and_then(|hosts| {
            hosts
                .shards
                .iter()
                .find(|h| h.name == shard_name && !h.host.is_empty())
        })
        .map_or(shard_name, |h| h.host.as_str())
}

fn shard_fileserver_document(spec: &HonseFarmClusterSpec, shard_name: &str) -> Document {
    let (mut doc, mut hf) = fileserver_base(spec, "Shard");
    let host = shard_host(spec, shard_name);

    hf.insert("FileServerName".into(), json!(host));
    hf.insert("ServerUri".into(), json!(format!("https://{host}")));
    hf.insert("CacheDirectory".into(), json!(FILESERVER_CACHE_DIRECTORY));
    hf.insert("CacheSizeHardLimitInGiB".into(), json!(SHARD_CACHE_LIMIT_GIB));
    hf.insert("UseColdStorage".into(), json!(false));
    hf.insert("ColdStorageDirectory".into(), Value::Null);
    hf.insert("ColdStorageSizeHardLimitInGiB".into(), json!(0));
    hf.insert(
        "ColdStorageUnusedFileRetentionPeriodInDays".into(),
        json!(SHARD_COLD_STORAGE_RETENTION_DAYS),
    );
    hf.insert(
        "UnusedFileRetentionPeriodInDays".into(),
        json!(SHARD_UNUSED_FILE_RETENTION_DAYS),
    );
    hf.insert(
        "DownloadQueueSize".into(),
        json!(FILESERVER_DOWNLOAD_QUEUE_SIZE),
    );
    hf.insert(
        "DownloadQueueReleaseSeconds".into(),
        json!(FILESERVER_DOWNLOAD_QUEUE_RELEASE_SECONDS),
    );
    hf.insert("DbContextPoolSize".into(), json!(FILESERVER_DB_POOL_SIZE));
    hf.insert("MainServerAddress".into(), json!(MAIN_SERVER_ADDRESS));
    hf.insert("MainFileServerAddress".into(), json!(MAIN_FILESERVER_ADDRESS));
    hf.insert(
        "DistributionFileServerAddress".into(),
        json!(MAIN_FILESERVER_ADDRESS),
    );
    hf.insert("MetricsPort".into(), json!(SHARD_METRICS_PORT));
    hf.insert(
        "ShardConfiguration".into(),
        json!({
            "Continents": ["*"],
            "FileMatch": "^[0-9a-fA-F]",
            "RegionUris": { "Default": format!("https://{host}") },
        }),
    );
    doc.insert("HonseFarm".into(), Value::Object(hf));

    doc.insert("Kestrel".into(), kestrel("http://*:5002"));
    doc
}
