//! Annowatch kubehub – client bootstrap, GVK resolution and watcher wiring

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::Stream;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use annowatch_core::{CachedObject, CoreError, ResourceKey, Uid};
use tracing::info;
use uuid::Uuid;

mod informer;

pub use informer::Informer;

/// Build a client from an explicit kubeconfig file, or fall back to the
/// default chain (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            info!(path = %path.display(), cluster = %cfg.cluster_url, "using kubeconfig");
            Client::try_from(cfg).context("creating client")
        }
        None => Client::try_default().await.context("creating client from default config"),
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK against the server's discovery data; also reports whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// List+watch stream for a GVK key, optionally scoped to one namespace.
/// Errors are yielded and the stream reconnects with backoff.
pub async fn watch_stream(
    client: Client,
    gvk_key: &str,
    namespace: Option<&str>,
) -> Result<impl Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>> + Send + 'static> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    info!(gvk = %gvk_key, ns = ?namespace, namespaced, "watch stream ready");
    Ok(watcher::watcher(api, watcher::Config::default()).default_backoff())
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<Uid, CoreError> {
    let u = Uuid::parse_str(uid_str).map_err(|e| CoreError::InvalidUid { uid: uid_str.to_string(), reason: e.to_string() })?;
    Ok(*u.as_bytes())
}

/// Convert a watched object into its cached form.
pub fn cached_from(obj: &DynamicObject) -> Result<CachedObject> {
    let meta = &obj.metadata;
    let name = meta.name.as_deref().ok_or(CoreError::MissingField("metadata.name"))?;
    let mut out = CachedObject::new(ResourceKey::new(meta.namespace.as_deref(), name));
    out.uid = meta.uid.as_deref().map(to_uid).transpose()?;
    out.resource_version = meta.resource_version.clone();
    out.generation = meta.generation;
    out.creation_ts = meta.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
    if let Some(labels) = &meta.labels {
        out.labels = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    if let Some(annos) = &meta.annotations {
        out.annotations = annos.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    out.raw = raw;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn deployment(ns: &str, name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        DynamicObject::new(name, &ar).within(ns)
    }

    #[test]
    fn parse_gvk_key_parses_core() {
        let gvk = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");
    }

    #[test]
    fn parse_gvk_key_parses_group() {
        let gvk = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("/v1/Kind").is_err());
    }

    #[test]
    fn cached_from_copies_identity_and_metadata() {
        let mut o = deployment("default", "foo");
        o.metadata.uid = Some("6f0b1c2e-3d4a-4b5c-8d9e-0a1b2c3d4e5f".to_string());
        o.metadata.resource_version = Some("42".to_string());
        o.metadata.generation = Some(3);
        o.metadata.annotations =
            Some(BTreeMap::from([("controller-example/myannotation".to_string(), "x".to_string())]));
        o.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        o.metadata.managed_fields = Some(vec![Default::default()]);

        let c = cached_from(&o).expect("convert");
        assert_eq!(c.key, ResourceKey::namespaced("default", "foo"));
        assert_eq!(c.resource_version.as_deref(), Some("42"));
        assert_eq!(c.generation, Some(3));
        assert_eq!(c.annotation("controller-example/myannotation"), Some("x"));
        assert_eq!(c.label("app"), Some("web"));
        assert_eq!(c.uid.map(|u| u[0]), Some(0x6f));
        assert!(c.raw["metadata"].get("managedFields").is_none());
        assert_eq!(c.raw["metadata"]["name"], "foo");
    }

    #[test]
    fn cached_from_rejects_bad_uid_and_missing_name() {
        let mut o = deployment("default", "foo");
        o.metadata.uid = Some("not-a-uuid".to_string());
        assert!(cached_from(&o).is_err());

        let mut nameless = deployment("default", "foo");
        nameless.metadata.name = None;
        assert!(cached_from(&nameless).is_err());
    }
}
