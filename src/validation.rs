//! Channel-name and username rules

use rand::Rng;

use crate::error::ChatError;

const CHANNEL_NAME_MAX: usize = 20;
const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 16;

/// Reserved usernames (compared case-insensitively)
const DISALLOWED_USERNAMES: &[&str] = &[
    "admin",
    "administrator",
    "moderator",
    "mod",
    "system",
    "root",
    "guest",
    "anonymous",
    "support",
    "help",
    "staff",
    "customer_service",
    "info",
    "server",
    "bot",
    "service",
    "user",
    "member",
    "website",
    "site",
    "chat",
    "official",
    "webmaster",
    "team",
    "security",
    "verify",
    "verified",
    "error",
    "null",
    "undefined",
];

/// Validate a multi channel name
pub fn validate_channel_name(name: &str) -> Result<(), ChatError> {
    if name.is_empty() || name.len() > CHANNEL_NAME_MAX {
        return Err(ChatError::InvalidChannelName(
            "Channel name must be between 1 and 20 characters".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChatError::InvalidChannelName(
            "Channel name can only contain alphanumeric characters, underscores and dashes"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate a requested username
///
/// Does not check whether the name is in use; the registry does that
/// atomically on insert.
pub fn validate_username(username: &str) -> Result<(), ChatError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(ChatError::InvalidUsername(
            "Username must be between 3 and 16 characters".to_string(),
        ));
    }

    let lowered = username.to_lowercase();
    if DISALLOWED_USERNAMES.contains(&lowered.as_str()) {
        return Err(ChatError::InvalidUsername(
            "Username is not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Whether the client asked to be assigned a generated name
pub fn is_anonymous_request(username: &str) -> bool {
    username.eq_ignore_ascii_case("anonymous")
}

/// Generate an `Anonymous#NNNN` username not rejected by `is_taken`
///
/// Starts with four digits and adds one after every ten collisions.
pub fn generate_anonymous_username(mut is_taken: impl FnMut(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    let mut digits: u32 = 4;
    let mut collisions = 0;

    loop {
        let number = rng.gen_range(0..10u64.pow(digits));
        let username = format!("Anonymous#{:0width$}", number, width = digits as usize);
        if !is_taken(&username) {
            return username;
        }

        collisions += 1;
        if collisions >= 10 {
            digits += 1;
            collisions = 0;
        }
    }
}
