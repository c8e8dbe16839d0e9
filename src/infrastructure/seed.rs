use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, PaginatorTrait, Set};
use tracing::info;

use crate::entities::{prelude::Users, users};
use crate::utils::hash::sha256_hex;

const DEFAULT_ADMIN_QUOTA: i64 = 1000;

/// First boot creates an `admin`/`admin` account so the instance is
/// reachable before any real users exist. The stored hash is argon2 over
/// the client-side SHA-256 digest, matching the login wire format.
pub async fn seed_initial_admin(db: &DatabaseConnection) -> anyhow::Result<()> {
    if Users::find().count(db).await? > 0 {
        return Ok(());
    }

    let digest = sha256_hex(b"admin");
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(digest.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("admin seed hash failed: {e}"))?
        .to_string();

    let now = Utc::now();
    let admin = users::ActiveModel {
        username: Set("admin".to_string()),
        password_hash: Set(password_hash),
        role: Set(users::ROLE_ADMIN.to_string()),
        quota: Set(DEFAULT_ADMIN_QUOTA),
        used: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    admin.insert(db).await?;

    info!("seeded initial admin account (change the password)");
    Ok(())
}
