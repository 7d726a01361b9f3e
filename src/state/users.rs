use crate::error::{AppError, Result};
use crate::models::User;
use crate::state::UserDirectory;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Read-only user directory indexed by email and id
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserDirectory {
    by_email: HashMap<String, User>,
    by_id: HashMap<i64, User>,
}

impl InMemoryUserDirectory {
    pub fn from_users(users: impl IntoIterator<Item = User>) -> Self {
        let mut directory = Self::default();
        for user in users {
            directory.by_email.insert(user.email.clone(), user.clone());
            directory.by_id.insert(user.id, user);
        }
        directory
    }

    /// Load a JSON array of `{id, name, email}` records
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await?;
        let users: Vec<User> = serde_json::from_slice(&raw).map_err(|e| {
            AppError::Serialization(format!("users file {}: {}", path.display(), e))
        })?;

        tracing::info!(path = %path.display(), users = users.len(), "Loaded user directory");
        Ok(Self::from_users(users))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.by_email.get(email).cloned())
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self.by_id.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_lookup_by_email_and_id() {
        let directory = InMemoryUserDirectory::from_users(vec![
            User::new(1, "Ayşe", "ayse@example.com"),
            User::new(2, "Mehmet", "mehmet@example.com"),
        ]);

        let user = directory.user_by_email("mehmet@example.com").await.unwrap().unwrap();
        assert_eq!(user.id, 2);
        assert_eq!(directory.user_by_id(1).await.unwrap().unwrap().name, "Ayşe");
        assert!(directory.user_by_email("nobody@example.com").await.unwrap().is_none());
        assert!(directory.user_by_id(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": 1, "name": "Ayşe", "email": "ayse@example.com"}},
                {{"id": 2, "name": "Mehmet", "email": "mehmet@example.com"}}]"#
        )
        .unwrap();

        let directory = InMemoryUserDirectory::load_json(file.path()).await.unwrap();
        assert_eq!(directory.len(), 2);
    }

    #[tokio::test]
    async fn test_load_json_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = InMemoryUserDirectory::load_json(file.path()).await.unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");

        let err = InMemoryUserDirectory::load_json("/nonexistent/users.json").await.unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}
