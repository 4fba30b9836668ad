use std::env;

pub const DEFAULT_API_PATH: &str = "/api/v1";
pub const DEFAULT_PORT: u16 = 6000;
const LOCAL_JWT_SECRET: &str = "super-secure-test-secret-value-local";

/// AppConfig
///
/// Immutable configuration loaded once at startup and shared through the
/// application state.
#[derive(Clone, Debug)]
pub struct AppConfig {
    // Postgres connection string. Without one, local runs use the in-memory store.
    pub db_url: Option<String>,
    // Runtime environment marker. Controls the x-user-id bypass and clearData.
    pub env: Env,
    // HS256 secret used to validate bearer tokens.
    pub jwt_secret: String,
    // Prefix of every generated route, e.g. `/api/v1`.
    pub api_path: String,
    pub port: u16,
}

/// Env
///
/// Development conveniences are only active in `Local`.
#[derive(Clone, PartialEq, Debug)]
pub enum Env {
    Local,
    Production,
}

impl Default for AppConfig {
    /// default
    ///
    /// A non-panicking configuration for test setup: local environment,
    /// in-memory store.
    fn default() -> Self {
        Self {
            db_url: None,
            env: Env::Local,
            jwt_secret: LOCAL_JWT_SECRET.to_string(),
            api_path: DEFAULT_API_PATH.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads the configuration from environment variables.
    ///
    /// # Panics
    /// Panics in `Production` when `DATABASE_URL` or `JWT_SECRET` is missing,
    /// and in any environment when `PORT` is not a valid port number.
    pub fn load() -> Self {
        let env = match env::var("APP_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Local,
        };

        let jwt_secret = match env {
            Env::Production => {
                env::var("JWT_SECRET").expect("FATAL: JWT_SECRET must be set in production.")
            }
            Env::Local => env::var("JWT_SECRET").unwrap_or_else(|_| LOCAL_JWT_SECRET.to_string()),
        };

        let db_url = match env {
            Env::Production => Some(env::var("DATABASE_URL").expect("FATAL: DATABASE_URL required in prod")),
            Env::Local => env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
        };

        let api_path = env::var("API_PATH")
            .map(|path| path.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_API_PATH.to_string());

        let port = env::var("PORT")
            .map(|raw| raw.parse().expect("FATAL: PORT must be a valid port number"))
            .unwrap_or(DEFAULT_PORT);

        Self {
            db_url,
            env,
            jwt_secret,
            api_path,
            port,
        }
    }
}
