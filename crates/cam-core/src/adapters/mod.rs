//! External Adapters: Git hosting providers and secret resolution
//! (SPEC_FULL.md §4.7, §6.3).
//!
//! Grounded on `harness/trait_def.rs`'s object-safe adapter pattern, applied
//! to the pull-request flow instead of agent process spawning. A PR failure
//! never fails the task itself -- it only changes which event gets emitted.

use std::collections::HashMap;

use async_trait::async_trait;
use cam_db::models::Task;
use serde_json::json;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::events::{event_type, EventBus};

/// Adapter for a Git hosting provider (GitHub, GitLab, ...).
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `Box<dyn GitProvider>`
/// can be stored in the provider registry this module builds.
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// The provider key this adapter answers to, e.g. `"github"`.
    fn name(&self) -> &str;

    /// Create a pull request for `work_branch` against `base_branch`, or
    /// locate an already-open one for the same branch pair. Returns `None`
    /// when there is nothing to propose (e.g. no commits ahead of base).
    async fn create_or_locate_pr(
        &self,
        repo_url: &str,
        base_branch: &str,
        work_branch: &str,
        title: &str,
        body: &str,
        token: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Merge an already-open pull request.
    async fn merge_pr(&self, pr_url: &str, token: &str) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GitProvider) {}
};

/// Resolves a credential by key, preferring a worker-scoped secret over the
/// core process's own environment (SPEC_FULL.md §6.3).
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, worker_env: &HashMap<String, String>, key: &str) -> Option<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn SecretResolver) {}
};

/// Default resolver: worker-reported env first, core process env as
/// fallback. No separate secret store is part of this core.
pub struct ProcessEnvSecretResolver;

#[async_trait]
impl SecretResolver for ProcessEnvSecretResolver {
    async fn resolve(&self, worker_env: &HashMap<String, String>, key: &str) -> Option<String> {
        worker_env
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }
}

/// Guesses a provider key from a repo URL's host, unless `CAM_GIT_PROVIDER`
/// is set, in which case it forces the choice (SPEC_FULL.md §6.3: "Force
/// provider detection when URL is ambiguous"). Returns `None` for hosts this
/// core doesn't recognize and no override is set; the caller treats that as
/// "skip".
pub fn detect_provider(repo_url: &str) -> Option<&'static str> {
    if let Ok(forced) = std::env::var("CAM_GIT_PROVIDER") {
        return match forced.as_str() {
            "github" => Some("github"),
            "gitlab" => Some("gitlab"),
            "gitea" => Some("gitea"),
            _ => None,
        };
    }

    if repo_url.contains("github.com") {
        Some("github")
    } else if repo_url.contains("gitlab.com") {
        Some("gitlab")
    } else if repo_url.contains("gitea.com") || repo_url.contains("gitea") {
        Some("gitea")
    } else {
        None
    }
}

fn token_env_key(provider: &str) -> String {
    format!("{}_TOKEN", provider.to_uppercase())
}

/// Runs the `running -> awaiting_review` PR flow: detect provider, resolve a
/// token, create or locate the PR. Never returns an error for a provider
/// failure -- it emits `task.pr_skipped` / `task.pr_failed` and returns
/// `Ok(None)` so the task still reaches `awaiting_review`.
pub async fn open_pull_request(
    pool: &SqlitePool,
    bus: &EventBus,
    providers: &HashMap<&str, Box<dyn GitProvider>>,
    secrets: &dyn SecretResolver,
    task: &Task,
    worker_env: &HashMap<String, String>,
) -> Result<Option<String>> {
    let Some(provider_name) = detect_provider(&task.repo_url) else {
        bus.emit(
            pool,
            event_type::TASK_PR_SKIPPED,
            None,
            json!({"taskId": task.id, "reason": "unrecognized_provider"}),
        )
        .await?;
        return Ok(None);
    };

    let Some(provider) = providers.get(provider_name) else {
        bus.emit(
            pool,
            event_type::TASK_PR_SKIPPED,
            None,
            json!({"taskId": task.id, "reason": "provider_not_configured", "provider": provider_name}),
        )
        .await?;
        return Ok(None);
    };

    let token_key = token_env_key(provider_name);
    let Some(token) = secrets.resolve(worker_env, &token_key).await else {
        bus.emit(
            pool,
            event_type::TASK_PR_SKIPPED,
            None,
            json!({"taskId": task.id, "reason": "no_token", "provider": provider_name}),
        )
        .await?;
        return Ok(None);
    };

    let title = task.title.clone();
    let body = task.summary.clone().unwrap_or_default();
    match provider
        .create_or_locate_pr(&task.repo_url, &task.base_branch, &task.work_branch, &title, &body, &token)
        .await
    {
        Ok(Some(pr_url)) => {
            bus.emit(
                pool,
                event_type::TASK_PR_CREATED,
                None,
                json!({"taskId": task.id, "prUrl": pr_url, "provider": provider_name}),
            )
            .await?;
            Ok(Some(pr_url))
        }
        Ok(None) => {
            bus.emit(
                pool,
                event_type::TASK_PR_SKIPPED,
                None,
                json!({"taskId": task.id, "reason": "nothing_to_propose", "provider": provider_name}),
            )
            .await?;
            Ok(None)
        }
        Err(err) => {
            bus.emit(
                pool,
                event_type::TASK_PR_FAILED,
                None,
                json!({"taskId": task.id, "provider": provider_name, "error": err.to_string()}),
            )
            .await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProvider;

    #[async_trait]
    impl GitProvider for NoopProvider {
        fn name(&self) -> &str {
            "noop"
        }

        async fn create_or_locate_pr(
            &self,
            _repo_url: &str,
            _base_branch: &str,
            _work_branch: &str,
            _title: &str,
            _body: &str,
            _token: &str,
        ) -> anyhow::Result<Option<String>> {
            Ok(Some("https://example.invalid/pr/1".to_string()))
        }

        async fn merge_pr(&self, _pr_url: &str, _token: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn detects_github_gitlab_and_gitea_hosts() {
        assert_eq!(detect_provider("https://github.com/acme/widgets"), Some("github"));
        assert_eq!(detect_provider("https://gitlab.com/acme/widgets"), Some("gitlab"));
        assert_eq!(detect_provider("https://gitea.example.org/acme/widgets"), Some("gitea"));
        assert_eq!(detect_provider("https://example.invalid/acme/widgets"), None);
    }

    #[test]
    fn cam_git_provider_env_overrides_host_sniffing() {
        unsafe { std::env::set_var("CAM_GIT_PROVIDER", "gitea") };
        assert_eq!(detect_provider("https://github.com/acme/widgets"), Some("gitea"));
        unsafe { std::env::remove_var("CAM_GIT_PROVIDER") };
    }

    #[test]
    fn token_env_key_is_uppercase_provider_plus_token() {
        assert_eq!(token_env_key("github"), "GITHUB_TOKEN");
    }

    #[tokio::test]
    async fn noop_provider_implements_the_object_safe_trait() {
        let provider: Box<dyn GitProvider> = Box::new(NoopProvider);
        let pr = provider
            .create_or_locate_pr("repo", "main", "work", "t", "b", "tok")
            .await
            .unwrap();
        assert!(pr.is_some());
    }
}
