use crate::config::DatabaseTarget;
use crate::db::DbError;
use crate::db::pool_manager::PoolSettings;
use postgres::config::SslMode;
use postgres::{Client, Config, NoTls};
use r2d2::ManageConnection;

/// r2d2 manager for PostgreSQL clients bound to one configured database.
///
/// Every session is opened with server-side statement and
/// idle-in-transaction timeouts.
pub struct PgConnectionManager {
    config: Config,
}

impl PgConnectionManager {
    pub fn new(target: &DatabaseTarget, settings: &PoolSettings) -> Result<Self, DbError> {
        let ssl_mode = match target.ssl_mode.as_str() {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            other => {
                return Err(DbError::connection(format!(
                    "{}: unsupported ssl_mode '{}'",
                    target.name, other
                )));
            }
        };

        let mut config = Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&target.user)
            .dbname(&target.database)
            .application_name("nl-gate")
            .ssl_mode(ssl_mode)
            .connect_timeout(settings.acquire_timeout)
            .options(&format!(
                "-c statement_timeout={} -c idle_in_transaction_session_timeout={}",
                settings.statement_timeout.as_millis(),
                settings.idle_in_transaction_timeout.as_millis()
            ));

        if let Some(password) = target.password() {
            config.password(password);
        }

        Ok(Self { config })
    }
}

impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = postgres::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.config.connect(NoTls)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1")?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}
