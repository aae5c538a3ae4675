//! Login and signup forms.
//!
use serde::Deserialize;

pub const USERNAME_LEN: (usize, usize) = (4, 15);
pub const PASSWORD_LEN: (usize, usize) = (8, 80);
pub const EMAIL_MAX_LEN: usize = 50;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Checkbox, present when ticked.
    #[serde(default)]
    pub remember: Option<String>,
}

impl LoginForm {
    pub fn remember(&self) -> bool {
        matches!(
            self.remember.as_deref(),
            Some("on" | "y" | "yes" | "true" | "1")
        )
    }

    /// Messages of all failed checks, empty if the form is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        check_length("Username", &self.username, USERNAME_LEN, &mut errors);
        check_length("Password", &self.password, PASSWORD_LEN, &mut errors);
        errors
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RegisterForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RegisterForm {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        if !is_valid_email(&self.email) {
            errors.push("Invalid email".to_string());
        } else if self.email.chars().count() > EMAIL_MAX_LEN {
            errors.push(format!(
                "Email must be at most {EMAIL_MAX_LEN} characters long"
            ));
        }
        check_length("Username", &self.username, USERNAME_LEN, &mut errors);
        check_length("Password", &self.password, PASSWORD_LEN, &mut errors);
        errors
    }
}

fn check_length(field: &str, value: &str, (min, max): (usize, usize), errors: &mut Vec<String>) {
    let len = value.chars().count();
    if len < min || len > max {
        errors.push(format!(
            "{field} must be between {min} and {max} characters long"
        ));
    }
}

/// Shape check of an email address: one `@`, a local part and a dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return false,
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| !label.is_empty())
}
