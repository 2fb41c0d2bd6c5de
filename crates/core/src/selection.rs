//! Choosing which update launches and which updates can be deleted.

use crate::manifest::ManifestFilters;
use crate::update::Update;
use std::cmp::Ordering;
use time::OffsetDateTime;

/// Inputs shared by every policy decision.
#[derive(Clone, Debug, Default)]
pub struct SelectionContext {
    /// Filters most recently sent by the update server for this scope.
    pub filters: Option<ManifestFilters>,
}

impl SelectionContext {
    pub fn new(filters: Option<ManifestFilters>) -> Self {
        Self { filters }
    }

    fn passes_filters(&self, update: &Update) -> bool {
        match &self.filters {
            Some(filters) => filters.passes(&update.manifest_metadata()),
            None => true,
        }
    }
}

/// Pure decision logic over candidate updates.
pub trait SelectionPolicy: Send + Sync {
    /// Whether `candidate` should become current instead of `current`.
    fn should_replace(
        &self,
        candidate: &Update,
        current: Option<&Update>,
        ctx: &SelectionContext,
    ) -> bool;

    /// Pick the update to launch among launchable candidates.
    fn select_update_to_launch(&self, updates: &[Update], ctx: &SelectionContext)
    -> Option<Update>;

    /// Updates that may be removed once `launched` is running.
    fn select_updates_to_delete(
        &self,
        updates: &[Update],
        launched: &Update,
        ctx: &SelectionContext,
    ) -> Vec<Update>;

    /// Whether a server directive to roll back to `embedded`, stamped
    /// `commit_time`, should take effect over `current`.
    fn should_apply_rollback(
        &self,
        commit_time: OffsetDateTime,
        embedded: &Update,
        current: Option<&Update>,
        ctx: &SelectionContext,
    ) -> bool;
}

/// Newest compatible update wins; filters and runtime version gate eligibility.
#[derive(Clone, Debug)]
pub struct FilterAwarePolicy {
    runtime_version: String,
    retain_older: usize,
}

impl FilterAwarePolicy {
    pub fn new(runtime_version: impl Into<String>) -> Self {
        Self {
            runtime_version: runtime_version.into(),
            retain_older: 1,
        }
    }

    /// How many older updates survive deletion besides the launched one.
    pub fn with_retain_older(mut self, retain_older: usize) -> Self {
        self.retain_older = retain_older;
        self
    }

    fn is_eligible(&self, update: &Update, ctx: &SelectionContext) -> bool {
        update.runtime_version == self.runtime_version && ctx.passes_filters(update)
    }
}

fn newest_first(a: &Update, b: &Update) -> Ordering {
    b.commit_time
        .cmp(&a.commit_time)
        .then_with(|| b.id.cmp(&a.id))
}

impl SelectionPolicy for FilterAwarePolicy {
    fn should_replace(
        &self,
        candidate: &Update,
        current: Option<&Update>,
        ctx: &SelectionContext,
    ) -> bool {
        if !self.is_eligible(candidate, ctx) {
            return false;
        }
        let Some(current) = current else {
            return true;
        };
        if !ctx.passes_filters(current) {
            return true;
        }
        candidate.commit_time > current.commit_time
    }

    fn select_update_to_launch(
        &self,
        updates: &[Update],
        ctx: &SelectionContext,
    ) -> Option<Update> {
        updates
            .iter()
            .filter(|u| self.is_eligible(u, ctx))
            .min_by(|a, b| newest_first(a, b))
            .cloned()
    }

    fn select_updates_to_delete(
        &self,
        updates: &[Update],
        launched: &Update,
        ctx: &SelectionContext,
    ) -> Vec<Update> {
        let mut older: Vec<&Update> = updates
            .iter()
            .filter(|u| u.id != launched.id && u.commit_time < launched.commit_time)
            .collect();
        older.sort_by(|a, b| newest_first(a, b));

        let retained: Vec<_> = older
            .iter()
            .filter(|u| ctx.passes_filters(u))
            .take(self.retain_older)
            .map(|u| u.id)
            .collect();

        older
            .into_iter()
            .filter(|u| !retained.contains(&u.id))
            .cloned()
            .collect()
    }

    fn should_apply_rollback(
        &self,
        commit_time: OffsetDateTime,
        embedded: &Update,
        current: Option<&Update>,
        ctx: &SelectionContext,
    ) -> bool {
        if !self.is_eligible(embedded, ctx) {
            return false;
        }
        let Some(current) = current else {
            return true;
        };
        if current.id == embedded.id {
            return false;
        }
        if !ctx.passes_filters(current) {
            return true;
        }
        commit_time > current.commit_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdateStatus;
    use serde_json::json;
    use std::collections::BTreeMap;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn update(runtime: &str, age_secs: i64, branch: &str) -> Update {
        Update {
            id: Uuid::new_v4(),
            scope_key: "scope".to_string(),
            commit_time: OffsetDateTime::UNIX_EPOCH + Duration::days(365)
                - Duration::seconds(age_secs),
            runtime_version: runtime.to_string(),
            manifest: json!({"metadata": {"branch": branch}}),
            status: UpdateStatus::Ready,
            keep: true,
            last_accessed: OffsetDateTime::UNIX_EPOCH,
            successful_launch_count: 0,
            failed_launch_count: 0,
            launch_asset_id: None,
        }
    }

    fn main_only() -> SelectionContext {
        SelectionContext::new(Some(ManifestFilters::new(BTreeMap::from([(
            "branch".to_string(),
            json!("main"),
        )]))))
    }

    #[test]
    fn test_rejects_newer_update_with_other_runtime() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let current = update("1.0.0", 100, "main");
        let candidate = update("2.0.0", 0, "main");
        let ctx = SelectionContext::default();

        assert!(candidate.commit_time > current.commit_time);
        assert!(!policy.should_replace(&candidate, Some(&current), &ctx));
        assert!(!policy.should_replace(&candidate, None, &ctx));
    }

    #[test]
    fn test_replaces_older_or_missing_current() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let ctx = SelectionContext::default();
        let old = update("1.0.0", 100, "main");
        let new = update("1.0.0", 0, "main");

        assert!(policy.should_replace(&new, Some(&old), &ctx));
        assert!(!policy.should_replace(&old, Some(&new), &ctx));
        assert!(!policy.should_replace(&new, Some(&new), &ctx));
        assert!(policy.should_replace(&old, None, &ctx));
    }

    #[test]
    fn test_filters_gate_candidates_and_current() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let ctx = main_only();
        let staging_new = update("1.0.0", 0, "staging");
        let main_old = update("1.0.0", 100, "main");
        let staging_current = update("1.0.0", 10, "staging");

        assert!(!policy.should_replace(&staging_new, Some(&main_old), &ctx));
        assert!(policy.should_replace(&main_old, Some(&staging_current), &ctx));
    }

    #[test]
    fn test_select_update_to_launch_picks_newest_eligible() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let a = update("1.0.0", 50, "main");
        let b = update("1.0.0", 10, "main");
        let c = update("2.0.0", 0, "main");
        let d = update("1.0.0", 5, "staging");

        let chosen = policy
            .select_update_to_launch(&[a, b.clone(), c, d], &main_only())
            .unwrap();
        assert_eq!(chosen.id, b.id);
        assert!(policy.select_update_to_launch(&[], &main_only()).is_none());
    }

    #[test]
    fn test_select_updates_to_delete_keeps_newer_and_one_older() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let newer = update("1.0.0", 0, "main");
        let launched = update("1.0.0", 10, "main");
        let older_staging = update("1.0.0", 20, "staging");
        let older_main = update("1.0.0", 30, "main");
        let oldest = update("1.0.0", 40, "main");

        let all = vec![
            newer.clone(),
            launched.clone(),
            older_staging.clone(),
            older_main.clone(),
            oldest.clone(),
        ];
        let deleted: Vec<Uuid> = policy
            .select_updates_to_delete(&all, &launched, &main_only())
            .into_iter()
            .map(|u| u.id)
            .collect();

        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&older_staging.id));
        assert!(deleted.contains(&oldest.id));
        assert!(!deleted.contains(&older_main.id));
        assert!(!deleted.contains(&newer.id));
        assert!(!deleted.contains(&launched.id));
    }

    #[test]
    fn test_retain_older_zero_deletes_all_older() {
        let policy = FilterAwarePolicy::new("1.0.0").with_retain_older(0);
        let launched = update("1.0.0", 0, "main");
        let older = update("1.0.0", 10, "main");
        let deleted = policy.select_updates_to_delete(
            &[launched.clone(), older.clone()],
            &launched,
            &SelectionContext::default(),
        );
        assert_eq!(deleted, vec![older]);
    }

    #[test]
    fn test_should_apply_rollback() {
        let policy = FilterAwarePolicy::new("1.0.0");
        let ctx = main_only();
        let embedded = update("1.0.0", 100, "main");
        let current = update("1.0.0", 10, "main");
        let later = current.commit_time + Duration::seconds(1);
        let earlier = current.commit_time - Duration::seconds(1);

        assert!(policy.should_apply_rollback(later, &embedded, Some(&current), &ctx));
        assert!(!policy.should_apply_rollback(earlier, &embedded, Some(&current), &ctx));
        assert!(policy.should_apply_rollback(earlier, &embedded, None, &ctx));
        assert!(!policy.should_apply_rollback(later, &embedded, Some(&embedded), &ctx));

        let staging_current = update("1.0.0", 10, "staging");
        assert!(policy.should_apply_rollback(earlier, &embedded, Some(&staging_current), &ctx));

        let staging_embedded = update("1.0.0", 100, "staging");
        assert!(!policy.should_apply_rollback(later, &staging_embedded, None, &ctx));
        let other_runtime = update("2.0.0", 100, "main");
        assert!(!policy.should_apply_rollback(later, &other_runtime, None, &ctx));
    }
}
