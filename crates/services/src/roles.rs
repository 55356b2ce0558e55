//! Community role lookup and permission gating.

use std::sync::Arc;

use domains::{AppError, CommunityUserRole, DocumentStore, Permission, Record, Result, Write};

use crate::require;

#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn DocumentStore>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn role_for(&self, user_id: &str, community_id: &str) -> Result<Option<CommunityUserRole>> {
        let id = CommunityUserRole::doc_id(user_id, community_id);
        match self.store.get(CommunityUserRole::COLLECTION, &id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Creates or replaces the single role a user holds in a community.
    #[tracing::instrument(skip(self, role), fields(user = %role.user_id, community = %role.community_id))]
    pub async fn assign_role(&self, role: CommunityUserRole) -> Result<()> {
        require("userId", &role.user_id)?;
        require("communityId", &role.community_id)?;
        require("title", &role.title)?;
        self.store.commit_batch(vec![Write::set(&role)?]).await?;
        tracing::info!(title = %role.title, "role assigned");
        Ok(())
    }

    pub async fn has_permission(&self, user_id: &str, community_id: &str, permission: Permission) -> Result<bool> {
        Ok(self
            .role_for(user_id, community_id)
            .await?
            .is_some_and(|role| role.permissions.allows(permission)))
    }

    /// Passes when `actor_id` owns the content (`owner_id` is given only when
    /// ownership is enough for the action) or holds `permission`.
    pub async fn authorize(
        &self,
        actor_id: &str,
        community_id: &str,
        owner_id: Option<&str>,
        permission: Permission,
    ) -> Result<()> {
        if owner_id == Some(actor_id) {
            return Ok(());
        }
        if self.has_permission(actor_id, community_id, permission).await? {
            return Ok(());
        }
        Err(AppError::permission(format!(
            "{actor_id} lacks {} in community {community_id}",
            permission.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::RolePermissions;
    use storage_adapters::InMemoryDocumentStore;

    async fn resolver_with_moderator() -> RoleResolver {
        let resolver = RoleResolver::new(Arc::new(InMemoryDocumentStore::new()));
        resolver
            .assign_role(CommunityUserRole {
                user_id: "mod".into(),
                community_id: "c1".into(),
                title: "Moderator".into(),
                permissions: RolePermissions { can_moderate: true, ..Default::default() },
                badge: Some("shield".into()),
            })
            .await
            .unwrap();
        resolver
    }

    #[tokio::test]
    async fn test_owner_passes_without_role() {
        let roles = resolver_with_moderator().await;
        assert!(roles.authorize("u1", "c1", Some("u1"), Permission::Archive).await.is_ok());
    }

    #[tokio::test]
    async fn test_flag_is_scoped_to_community() {
        let roles = resolver_with_moderator().await;
        assert!(roles.authorize("mod", "c1", Some("u1"), Permission::Moderate).await.is_ok());
        let err = roles.authorize("mod", "c2", Some("u1"), Permission::Moderate).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
        let err = roles.authorize("mod", "c1", None, Permission::Pin).await.unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
    }

    #[tokio::test]
    async fn test_assign_requires_title() {
        let roles = RoleResolver::new(Arc::new(InMemoryDocumentStore::new()));
        let err = roles
            .assign_role(CommunityUserRole {
                user_id: "u1".into(),
                community_id: "c1".into(),
                title: "".into(),
                permissions: RolePermissions::default(),
                badge: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }
}
