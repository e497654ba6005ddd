use anyhow::Result;

use crate::db::{
    helpers::{delete_key, read_json, write_json},
    models::{StorageKey, ThrottleState, UserPreferences},
    Database,
};

/// Which survey throttle record to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyThrottleKey {
    /// Shared by the toggle and disable prompts.
    Esm,
    SiteSurvey,
}

impl SurveyThrottleKey {
    fn storage_key(self) -> StorageKey {
        match self {
            SurveyThrottleKey::Esm => StorageKey::EsmThrottle,
            SurveyThrottleKey::SiteSurvey => StorageKey::EsmSiteSurveyThrottle,
        }
    }
}

impl Database {
    /// Absent means enabled.
    pub async fn is_enabled(&self) -> Result<bool> {
        self.execute(|conn| Ok(read_json::<bool>(conn, StorageKey::IsEnabled)?.unwrap_or(true)))
            .await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.execute(move |conn| write_json(conn, StorageKey::IsEnabled, &enabled))
            .await
    }

    /// Flips `isEnabled` in one storage task and returns the new value.
    pub async fn toggle_enabled(&self) -> Result<bool> {
        self.execute(|conn| {
            let current = read_json::<bool>(conn, StorageKey::IsEnabled)?.unwrap_or(true);
            let next = !current;
            write_json(conn, StorageKey::IsEnabled, &next)?;
            Ok(next)
        })
        .await
    }

    pub async fn user_id(&self) -> Result<Option<String>> {
        self.execute(|conn| non_empty(read_json::<String>(conn, StorageKey::UserId)?))
            .await
    }

    pub async fn api_key(&self) -> Result<Option<String>> {
        self.execute(|conn| non_empty(read_json::<String>(conn, StorageKey::SimplifyApiKey)?))
            .await
    }

    pub async fn store_credentials(&self, user_id: &str, api_key: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let api_key = api_key.to_string();
        self.execute(move |conn| {
            write_json(conn, StorageKey::SimplifyApiKey, &api_key)?;
            write_json(conn, StorageKey::UserId, &user_id)?;
            Ok(())
        })
        .await
    }

    pub async fn clear_credentials(&self) -> Result<()> {
        self.execute(|conn| {
            delete_key(conn, StorageKey::SimplifyApiKey)?;
            delete_key(conn, StorageKey::UserId)?;
            Ok(())
        })
        .await
    }

    pub async fn preferences(&self) -> Result<UserPreferences> {
        self.execute(|conn| {
            Ok(read_json::<UserPreferences>(conn, StorageKey::Settings)?.unwrap_or_default())
        })
        .await
    }

    pub async fn set_preferences(&self, preferences: UserPreferences) -> Result<()> {
        self.execute(move |conn| write_json(conn, StorageKey::Settings, &preferences))
            .await
    }

    pub async fn blacklist(&self) -> Result<Vec<String>> {
        self.execute(|conn| Ok(read_json::<Vec<String>>(conn, StorageKey::Blacklist)?.unwrap_or_default()))
            .await
    }

    /// Appends `domain` to the user blacklist. Returns `false` if it was
    /// already listed.
    pub async fn add_to_blacklist(&self, domain: &str) -> Result<bool> {
        let domain = domain.to_string();
        self.execute(move |conn| {
            let mut list = read_json::<Vec<String>>(conn, StorageKey::Blacklist)?.unwrap_or_default();
            if list.iter().any(|entry| entry == &domain) {
                return Ok(false);
            }
            list.push(domain);
            write_json(conn, StorageKey::Blacklist, &list)?;
            Ok(true)
        })
        .await
    }

    pub async fn throttle_state(&self, key: SurveyThrottleKey) -> Result<ThrottleState> {
        self.execute(move |conn| {
            Ok(read_json::<ThrottleState>(conn, key.storage_key())?.unwrap_or_default())
        })
        .await
    }

    /// Runs `decide` against the stored throttle record and persists the
    /// record it leaves behind when it returns `true`.
    pub async fn update_throttle<F>(&self, key: SurveyThrottleKey, decide: F) -> Result<bool>
    where
        F: FnOnce(&mut ThrottleState) -> bool + Send + 'static,
    {
        self.execute(move |conn| {
            let mut state =
                read_json::<ThrottleState>(conn, key.storage_key())?.unwrap_or_default();
            let admitted = decide(&mut state);
            if admitted {
                write_json(conn, key.storage_key(), &state)?;
            }
            Ok(admitted)
        })
        .await
    }
}

fn non_empty(value: Option<String>) -> Result<Option<String>> {
    Ok(value.filter(|v| !v.trim().is_empty()))
}
