//! Per-community notification preferences with all-enabled defaults.

use std::sync::Arc;

use chrono::Utc;
use domains::{Category, DocumentStore, NotificationPreferences, Record, Result, Transaction};

use crate::RetryBudget;

/// Emergency alerts always go out; every other category follows its flag.
pub fn should_deliver(preferences: &NotificationPreferences, category: Category) -> bool {
    category.is_emergency_alert() || preferences.is_enabled(category)
}

#[derive(Clone)]
pub struct PreferenceResolver {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl PreferenceResolver {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32) -> Self {
        Self { store, max_attempts }
    }

    /// Returns the stored preferences, or the defaults when none exist yet.
    ///
    /// Defaults are persisted on first use, and only while no record exists.
    /// A record saved concurrently wins over the defaults. Failing to persist
    /// does not fail the lookup.
    pub async fn resolve(&self, user_id: &str, community_id: &str) -> Result<NotificationPreferences> {
        let id = NotificationPreferences::doc_id(user_id, community_id);
        let mut tx = Transaction::new(self.store.as_ref());
        if let Some(prefs) = tx.get_record::<NotificationPreferences>(&id).await? {
            return Ok(prefs);
        }

        let defaults = NotificationPreferences::defaults(user_id, community_id);
        if let Err(err) = tx.set(&defaults) {
            tracing::warn!(%err, "default preferences not encodable");
            return Ok(defaults);
        }
        match tx.commit().await {
            Ok(()) => Ok(defaults),
            Err(err) if err.is_conflict() => {
                tracing::debug!(user = user_id, community = community_id, "preferences stored concurrently, re-reading");
                match self.store.get(NotificationPreferences::COLLECTION, &id).await? {
                    Some(doc) => Ok(doc.decode()?),
                    None => Ok(defaults),
                }
            }
            Err(err) => {
                tracing::warn!(user = user_id, community = community_id, %err, "default preferences not persisted");
                Ok(defaults)
            }
        }
    }

    /// Applies flag changes on top of the current preferences and stores them.
    #[tracing::instrument(skip(self, changes))]
    pub async fn update(
        &self,
        user_id: &str,
        community_id: &str,
        changes: &[(Category, bool)],
    ) -> Result<NotificationPreferences> {
        let id = NotificationPreferences::doc_id(user_id, community_id);
        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let mut prefs = tx
                .get_record::<NotificationPreferences>(&id)
                .await?
                .unwrap_or_else(|| NotificationPreferences::defaults(user_id, community_id));
            prefs.categories.extend(changes.iter().copied());
            prefs.updated_at = Utc::now();
            tx.set(&prefs)?;
            match tx.commit().await {
                Ok(()) => return Ok(prefs),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "preference update conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("preference update for {id}")))
    }
}
