//! Per-request rotation of identifying headers.

use changewatch_shared::HeaderPool;
use rand::seq::SliceRandom;

/// Browser-like `Accept` header sent with every listing request.
pub const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// The identifying headers chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_agent: String,
    pub accept_language: String,
}

/// Pick a user agent and accept-language uniformly at random from the pool.
///
/// Empty pools are rejected at config load; the fallbacks only guard
/// hand-built configs.
pub fn pick(pool: &HeaderPool) -> RequestIdentity {
    let mut rng = rand::thread_rng();
    let user_agent = pool
        .user_agents
        .choose(&mut rng)
        .cloned()
        .unwrap_or_else(|| concat!("changewatch/", env!("CARGO_PKG_VERSION")).to_string());
    let accept_language = pool
        .accept_languages
        .choose(&mut rng)
        .cloned()
        .unwrap_or_else(|| "en-US,en;q=0.9".to_string());

    RequestIdentity {
        user_agent,
        accept_language,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn picks_stay_within_pool() {
        let pool = HeaderPool::default();
        for _ in 0..50 {
            let id = pick(&pool);
            assert!(pool.user_agents.contains(&id.user_agent));
            assert!(pool.accept_languages.contains(&id.accept_language));
        }
    }

    #[test]
    fn rotation_uses_more_than_one_agent() {
        let pool = HeaderPool::default();
        let seen: HashSet<String> = (0..200).map(|_| pick(&pool).user_agent).collect();
        assert!(seen.len() > 1);
    }

    #[test]
    fn empty_pool_falls_back() {
        let pool = HeaderPool {
            user_agents: vec![],
            accept_languages: vec![],
        };
        let id = pick(&pool);
        assert!(id.user_agent.starts_with("changewatch/"));
        assert_eq!(id.accept_language, "en-US,en;q=0.9");
    }
}
