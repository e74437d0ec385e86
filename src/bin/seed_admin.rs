use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHasher};

/// Prints the SQL that creates the first admin account.
/// Usage: seed_admin <email> <password> [display name]
fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(email), Some(password)) = (args.next(), args.next()) else {
        anyhow::bail!("Usage: seed_admin <email> <password> [display name]");
    };
    let display_name = args.next().unwrap_or_else(|| "Administrator".to_string());

    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        anyhow::bail!("not an email address: {email}");
    }
    if password.trim().len() < 8 {
        anyhow::bail!("password must be at least 8 characters");
    }

    let salt = SaltString::generate(&mut OsRng);
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash failed: {e}"))?
        .to_string();

    println!(
        "INSERT INTO app_user (email, display_name, password_hash, roles) VALUES ('{}', '{}', '{}', 1);",
        sql_quote(&email),
        sql_quote(&display_name),
        phc
    );
    Ok(())
}

fn sql_quote(s: &str) -> String {
    s.replace('\'', "''")
}
