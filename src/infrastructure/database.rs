use crate::entities::{history_records, redeem_codes, usage_logs, users};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::env;
use std::time::Duration;
use tracing::info;

pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    info!("database: {}", db_url);

    let mut opt = ConnectOptions::new(&db_url);
    opt.max_connections(50)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("database connected");

    run_migrations(&db).await?;
    crate::infrastructure::seed::seed_initial_admin(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmts = vec![
        schema
            .create_table_from_entity(users::Entity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(redeem_codes::Entity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(usage_logs::Entity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(history_records::Entity)
            .if_not_exists()
            .to_owned(),
    ];

    for stmt in stmts {
        let stmt = builder.build(&stmt);
        db.execute(stmt).await?;
    }

    Ok(())
}
