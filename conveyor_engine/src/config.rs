//! Engine configuration — loaded from environment variables.

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Redis endpoint URL; include credentials when the store requires auth.
    pub redis_url: String,
    /// Docker daemon endpoint.
    pub docker_host: String,
    /// Name of the list holding the active job index.
    pub jobs_key: String,
    /// Seconds before job record and log keys expire; 0 disables expiry.
    pub key_ttl: u64,
    /// Remove jobs from the active index once execution ends.
    pub remove_done: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let redis_url = std::env::var("CONVEYOR_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let docker_host = std::env::var("DOCKER_HOST")
            .unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string());
        let jobs_key = std::env::var("CONVEYOR_JOBS_KEY").unwrap_or_else(|_| "jobs".to_string());
        let key_ttl = std::env::var("CONVEYOR_KEY_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let remove_done = std::env::var("CONVEYOR_REMOVE_DONE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        Self {
            redis_url,
            docker_host,
            jobs_key,
            key_ttl,
            remove_done,
        }
    }
}
