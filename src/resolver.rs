//! Model resolution. First rule that applies wins:
//! 1. explicit provider name — unknown names are a configuration error, no
//!    fallback; an unknown *model* name falls back to the provider's first
//!    available model;
//! 2. the user's stored default pair — any lookup failure, unresolvable
//!    provider, or model missing from the provider's set falls through
//!    entirely;
//! 3. the system default provider.

use crate::db::DbPool;
use crate::registry::{ProviderHandle, ProviderRegistry};
use crate::types::{ChatflowError, ModelSelection, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserModelPreference {
    pub user_id: i64,
    pub provider_name: String,
    pub model_name: String,
}

pub async fn resolve(
    registry: &ProviderRegistry,
    pool: &DbPool,
    user_id: Option<i64>,
    explicit_provider: Option<&str>,
    explicit_model: Option<&str>,
) -> Result<ModelSelection> {
    if let Some(provider_name) = non_blank(explicit_provider) {
        // Explicitly named providers are not defended: a bad name is a
        // configuration error the caller must see.
        let handle = registry.get(provider_name).ok_or_else(|| {
            ChatflowError::Config(format!("unknown provider '{}'", provider_name))
        })?;
        let model = pick_model(handle, explicit_model)?;
        return Ok(ModelSelection {
            provider: handle.name.clone(),
            model,
        });
    }

    if let Some(user_id) = user_id {
        if let Some(selection) = resolve_user_preference(registry, pool, user_id).await {
            return Ok(selection);
        }
    }

    let handle = registry
        .get_default()
        .ok_or_else(|| ChatflowError::Config("default provider is not configured".to_string()))?;
    let model = pick_model(handle, explicit_model)?;
    Ok(ModelSelection {
        provider: handle.name.clone(),
        model,
    })
}

/// Stored preferences are best-effort only: every failure mode falls through
/// to the system default rather than surfacing.
async fn resolve_user_preference(
    registry: &ProviderRegistry,
    pool: &DbPool,
    user_id: i64,
) -> Option<ModelSelection> {
    let preference = match get_user_preference(pool, user_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("user preference lookup failed for user {}: {}", user_id, e);
            return None;
        }
    };

    let handle = match registry.get(&preference.provider_name) {
        Some(h) => h,
        None => {
            tracing::warn!(
                "user {} prefers unknown provider '{}', using system default",
                user_id,
                preference.provider_name
            );
            return None;
        }
    };

    let available = handle.available_models();
    if !available.iter().any(|m| m.name == preference.model_name) {
        tracing::warn!(
            "user {} prefers model '{}' not offered by provider '{}', using system default",
            user_id,
            preference.model_name,
            handle.name
        );
        return None;
    }

    Some(ModelSelection {
        provider: handle.name.clone(),
        model: preference.model_name,
    })
}

/// Requested model if it is currently available, otherwise the provider's
/// first available model. An empty catalog is fatal misconfiguration.
fn pick_model(handle: &ProviderHandle, requested: Option<&str>) -> Result<String> {
    let available = handle.available_models();

    if let Some(requested) = non_blank(requested) {
        if available.iter().any(|m| m.name == requested) {
            return Ok(requested.to_string());
        }
        tracing::warn!(
            "model '{}' not available on provider '{}', using first available",
            requested,
            handle.name
        );
    }

    available
        .first()
        .map(|m| m.name.clone())
        .ok_or_else(|| {
            ChatflowError::Config(format!(
                "no available models for provider '{}'",
                handle.name
            ))
            .into()
        })
}

pub async fn get_user_preference(
    pool: &DbPool,
    user_id: i64,
) -> Result<Option<UserModelPreference>> {
    let row = sqlx::query_as::<_, UserModelPreference>(
        "SELECT user_id, provider_name, model_name FROM user_model_preferences WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn set_user_preference(
    pool: &DbPool,
    user_id: i64,
    provider_name: &str,
    model_name: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_model_preferences (user_id, provider_name, model_name) VALUES (?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET provider_name = excluded.provider_name, \
         model_name = excluded.model_name, updated_at = datetime('now')",
    )
    .bind(user_id)
    .bind(provider_name)
    .bind(model_name)
    .execute(pool)
    .await?;
    Ok(())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v.trim()),
        _ => None,
    }
}
