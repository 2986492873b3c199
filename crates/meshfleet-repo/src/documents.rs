//! JSON documents stored in codebases
//!
//! Listeners and connectors edit configuration documents such as the ingress
//! `main.json` by reading the current file, changing a few dotted keys and
//! writing it back in a single batch.

use jsonptr::PointerBuf;
use serde_json::{Map, Value};

use crate::{Batch, BatchItem, RepoClient, RepoError, Result};

/// Directory holding config documents inside a codebase
pub const CONFIG_DIR: &str = "/config";
/// Ingress pipy main configuration
pub const MAIN_JSON: &str = "main.json";
/// Service registry written by the local connector
pub const REGISTRY_JSON: &str = "registry.json";
/// Ingress routes written by the local connector
pub const INGRESS_JSON: &str = "ingress.json";

/// Read a JSON document; a missing file reads as `{}`
pub async fn read_json(client: &dyn RepoClient, path: &str) -> Result<Value> {
    match client.get_file(path).await? {
        Some(content) if !content.trim().is_empty() => {
            serde_json::from_str(&content).map_err(|e| RepoError::Document {
                path: path.to_string(),
                message: e.to_string(),
            })
        }
        _ => Ok(Value::Object(Map::new())),
    }
}

/// Set `value` at a dotted key such as `listeners.http.port`,
/// creating intermediate objects
pub fn set_value(doc: &mut Value, dotted_key: &str, value: Value) -> Result<()> {
    let pointer = PointerBuf::from_tokens(dotted_key.split('.'));
    pointer
        .assign(doc, value)
        .map_err(|e| RepoError::Document {
            path: dotted_key.to_string(),
            message: e.to_string(),
        })?;
    Ok(())
}

/// Value at a dotted key, if present
pub fn get_value<'a>(doc: &'a Value, dotted_key: &str) -> Option<&'a Value> {
    dotted_key
        .split('.')
        .try_fold(doc, |current, key| current.get(key))
}

/// Read `<basepath><dir>/<filename>`, apply `edit`, and write it back with
/// one commit of `basepath`
pub async fn update_json_document<F>(
    client: &dyn RepoClient,
    basepath: &str,
    dir: &str,
    filename: &str,
    edit: F,
) -> Result<()>
where
    F: FnOnce(&mut Value) -> Result<()> + Send,
{
    let full_path = format!("{}{}/{}", basepath, dir, filename);
    let mut doc = read_json(client, &full_path).await?;
    edit(&mut doc)?;
    let item = BatchItem::json(dir, filename, &doc)?;
    client
        .batch(&[Batch {
            basepath: basepath.to_string(),
            items: vec![item],
        }])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepoClient;
    use serde_json::json;

    #[test]
    fn dotted_keys_create_nested_objects() {
        let mut doc = json!({});
        set_value(&mut doc, "listeners.http.port", json!(8000)).unwrap();
        set_value(&mut doc, "listeners.http.enabled", json!(true)).unwrap();
        assert_eq!(
            doc,
            json!({ "listeners": { "http": { "port": 8000, "enabled": true } } })
        );
        assert_eq!(get_value(&doc, "listeners.http.port"), Some(&json!(8000)));
        assert_eq!(get_value(&doc, "listeners.tls"), None);
    }

    #[test]
    fn set_value_overwrites_existing_keys() {
        let mut doc = json!({ "tls": { "enabled": false, "listen": 443 } });
        set_value(&mut doc, "tls.enabled", json!(true)).unwrap();
        assert_eq!(doc, json!({ "tls": { "enabled": true, "listen": 443 } }));
    }

    #[tokio::test]
    async fn missing_document_reads_as_empty_object() {
        let repo = MemoryRepoClient::new();
        let doc = read_json(&repo, "/base/ingress/config/main.json")
            .await
            .unwrap();
        assert_eq!(doc, json!({}));
    }

    #[tokio::test]
    async fn update_preserves_untouched_keys_and_commits() {
        let repo = MemoryRepoClient::new();
        repo.create_codebase("/base/ingress").await.unwrap();
        repo.upsert_file(
            "/base/ingress/config/main.json",
            r#"{"logLevel":"info","listeners":[]}"#,
        )
        .await
        .unwrap();

        update_json_document(&repo, "/base/ingress", CONFIG_DIR, MAIN_JSON, |doc| {
            set_value(doc, "http.enabled", json!(true))
        })
        .await
        .unwrap();

        let doc = read_json(&repo, "/base/ingress/config/main.json")
            .await
            .unwrap();
        assert_eq!(doc["logLevel"], json!("info"));
        assert_eq!(doc["http"]["enabled"], json!(true));
        assert_eq!(repo.commit_count("/base/ingress"), 1);
    }
}
