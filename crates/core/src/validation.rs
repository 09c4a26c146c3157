use thiserror::Error;

pub const MAX_ALIAS_LENGTH: usize = 63;
pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MAX_TITLE_LENGTH: usize = 256;
pub const PASSWORD_HASH_LENGTH: usize = 64;
pub const INVITATION_UID_LENGTH: usize = 40;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("alias must be 1-63 lowercase letters, digits or inner hyphens")]
    InvalidAlias,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password hash must be 64 lowercase hex characters")]
    InvalidPasswordHash,
    #[error("invitation code must be 40 lowercase hex characters")]
    InvalidInvitationUid,
    #[error("title must be 1-{MAX_TITLE_LENGTH} characters")]
    InvalidTitle,
    #[error("expiry must be between 1 and {0} days")]
    ExpiryOutOfRange(u32),
}

/// DNS-label style alias. Aliases never look like ids: an all-digit alias is
/// rejected so route parameters stay unambiguous.
pub fn validate_alias(alias: &str) -> Result<(), ValidationError> {
    let bytes = alias.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_ALIAS_LENGTH {
        return Err(ValidationError::InvalidAlias);
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(ValidationError::InvalidAlias);
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    {
        return Err(ValidationError::InvalidAlias);
    }
    if bytes.iter().all(u8::is_ascii_digit) {
        return Err(ValidationError::InvalidAlias);
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.len() > MAX_EMAIL_LENGTH || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidEmail);
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ValidationError::InvalidEmail);
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

/// Emails compare case-insensitively everywhere.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn validate_password_hash(hash: &str) -> Result<(), ValidationError> {
    if is_lower_hex(hash, PASSWORD_HASH_LENGTH) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPasswordHash)
    }
}

pub fn validate_invitation_uid(uid: &str) -> Result<(), ValidationError> {
    if is_lower_hex(uid, INVITATION_UID_LENGTH) {
        Ok(())
    } else {
        Err(ValidationError::InvalidInvitationUid)
    }
}

pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    let length = title.chars().count();
    if length == 0 || length > MAX_TITLE_LENGTH || title.trim().is_empty() {
        return Err(ValidationError::InvalidTitle);
    }
    Ok(())
}

pub fn validate_expiry_days(days: u32, max_days: u32) -> Result<(), ValidationError> {
    if (1..=max_days).contains(&days) {
        Ok(())
    } else {
        Err(ValidationError::ExpiryOutOfRange(max_days))
    }
}

fn is_lower_hex(value: &str, length: usize) -> bool {
    value.len() == length
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_alias_cases() {
        for alias in ["acme", "acme-corp", "a", "team42", "x-1-y"] {
            assert!(validate_alias(alias).is_ok(), "{alias}");
        }
        let too_long = "a".repeat(MAX_ALIAS_LENGTH + 1);
        for alias in ["", "-acme", "acme-", "Acme", "ac me", "acme.corp", "1234", too_long.as_str()] {
            assert_eq!(validate_alias(alias), Err(ValidationError::InvalidAlias), "{alias}");
        }
    }

    #[test]
    fn validate_email_cases() {
        for email in ["a@x", "bob.smith@example.com", "x+tag@sub.example.org"] {
            assert!(validate_email(email).is_ok(), "{email}");
        }
        for email in ["", "plain", "@x", "a@", "a@@x", "a b@x", "a@.x", "a@x."] {
            assert_eq!(validate_email(email), Err(ValidationError::InvalidEmail), "{email}");
        }
    }

    #[test]
    fn normalize_email_lowercases_and_trims() {
        assert_eq!(normalize_email("  Bob@Example.COM "), "bob@example.com");
    }

    #[test]
    fn validate_password_hash_requires_lowercase_sha256_hex() {
        assert!(validate_password_hash(&"ab".repeat(32)).is_ok());
        assert!(validate_password_hash(&"AB".repeat(32)).is_err());
        assert!(validate_password_hash(&"ab".repeat(31)).is_err());
        assert!(validate_password_hash(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn validate_invitation_uid_requires_sha1_width() {
        assert!(validate_invitation_uid(&"0f".repeat(20)).is_ok());
        assert!(validate_invitation_uid(&"0f".repeat(21)).is_err());
        assert!(validate_invitation_uid("not-a-uid").is_err());
    }

    #[test]
    fn validate_title_bounds() {
        assert!(validate_title("Bank login").is_ok());
        assert!(validate_title("").is_err());
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"t".repeat(MAX_TITLE_LENGTH + 1)).is_err());
    }

    #[test]
    fn validate_expiry_days_bounds() {
        assert!(validate_expiry_days(1, 30).is_ok());
        assert!(validate_expiry_days(30, 30).is_ok());
        assert_eq!(
            validate_expiry_days(0, 30),
            Err(ValidationError::ExpiryOutOfRange(30))
        );
        assert!(validate_expiry_days(31, 30).is_err());
    }
}
