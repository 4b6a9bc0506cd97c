//! Onboarding requests: the call that turns a fresh backend into a session
//! for one account.
//!
//! Exactly one of these runs per session, right after the `Config` call.
//! Fields left empty get the defaults the backend expects: random 15-digit
//! phone number and TOTP verifier, a `dev-<15 digits>` device name, and the
//! host's platform and OS release.

use rand::Rng;
use serde_json::{json, Value};

use crate::error::{FlowError, Result};

const RANDOM_DIGITS: usize = 15;

/// Start an account that already has a device on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartUp {
    pub username: String,
}

impl StartUp {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Register a new account and this machine as its first device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccount {
    pub username: String,
    pub password: String,
    pub device_name: String,
    pub phone_number: String,
    pub platform: String,
    pub os_release: String,
    pub email_confirm_code: String,
    pub totp_verifier: String,
}

impl CreateAccount {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            device_name: String::new(),
            phone_number: String::new(),
            platform: host_platform().to_string(),
            os_release: host_os_release(),
            email_confirm_code: String::new(),
            totp_verifier: String::new(),
        }
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn phone_number(mut self, number: impl Into<String>) -> Self {
        self.phone_number = number.into();
        self
    }

    pub fn email_confirm_code(mut self, code: impl Into<String>) -> Self {
        self.email_confirm_code = code.into();
        self
    }

    pub fn totp_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.totp_verifier = verifier.into();
        self
    }
}

/// Add this machine as a new device of an existing account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDevice {
    pub username: String,
    pub password: String,
    pub device_name: String,
    pub platform: String,
    pub os_release: String,
}

impl CreateDevice {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            device_name: String::new(),
            platform: host_platform().to_string(),
            os_release: host_os_release(),
        }
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }
}

/// The three mutually exclusive ways to bring a session up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Onboarding {
    StartUp(StartUp),
    CreateAccount(CreateAccount),
    CreateDevice(CreateDevice),
}

impl Onboarding {
    /// Account identifier the session is registered under.
    pub fn username(&self) -> &str {
        match self {
            Onboarding::StartUp(req) => &req.username,
            Onboarding::CreateAccount(req) => &req.username,
            Onboarding::CreateDevice(req) => &req.username,
        }
    }

    /// Backend method name.
    pub fn method(&self) -> &'static str {
        match self {
            Onboarding::StartUp(_) => "StartUp",
            Onboarding::CreateAccount(_) => "CreateAccount",
            Onboarding::CreateDevice(_) => "CreateDevice",
        }
    }

    /// Reject requests the backend could never accept.
    pub fn validate(&self) -> Result<()> {
        let username = self.username();
        if username.is_empty() {
            return Err(FlowError::InvalidArgument("username is empty".into()));
        }
        if username.contains(['/', '\\']) || username == "." || username == ".." {
            return Err(FlowError::InvalidArgument(format!(
                "username {:?} cannot name a storage directory",
                username
            )));
        }
        Ok(())
    }

    /// Request parameters, with empty fields replaced by their defaults.
    pub fn params(&self, server_uri: &str) -> Value {
        match self {
            Onboarding::StartUp(req) => json!({
                "Username": req.username,
                "ServerURI": server_uri,
            }),
            Onboarding::CreateAccount(req) => json!({
                "PhoneNumber": or_random_digits(&req.phone_number),
                "DeviceName": or_device_name(&req.device_name),
                "Username": req.username,
                "ServerURI": server_uri,
                "Platform": req.platform,
                "OSRelease": req.os_release,
                "Password": req.password,
                "TotpVerifier": or_random_digits(&req.totp_verifier),
                "EmailConfirmCode": req.email_confirm_code,
                "NotifyToken": "",
            }),
            Onboarding::CreateDevice(req) => json!({
                "Username": req.username,
                "ServerURI": server_uri,
                "DeviceName": or_device_name(&req.device_name),
                "Password": req.password,
                "Platform": req.platform,
                "OSRelease": req.os_release,
            }),
        }
    }
}

impl From<StartUp> for Onboarding {
    fn from(req: StartUp) -> Self {
        Onboarding::StartUp(req)
    }
}

impl From<CreateAccount> for Onboarding {
    fn from(req: CreateAccount) -> Self {
        Onboarding::CreateAccount(req)
    }
}

impl From<CreateDevice> for Onboarding {
    fn from(req: CreateDevice) -> Self {
        Onboarding::CreateDevice(req)
    }
}

fn or_random_digits(value: &str) -> String {
    if value.is_empty() {
        random_digits(RANDOM_DIGITS)
    } else {
        value.to_string()
    }
}

fn or_device_name(value: &str) -> String {
    if value.is_empty() {
        format!("dev-{}", random_digits(RANDOM_DIGITS))
    } else {
        value.to_string()
    }
}

fn random_digits(count: usize) -> String {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Platform tag in the backend's vocabulary.
fn host_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

#[cfg(unix)]
fn host_os_release() -> String {
    nix::sys::utsname::uname()
        .map(|uts| uts.release().to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn host_os_release() -> String {
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_account_defaults() {
        let req = Onboarding::from(CreateAccount::new("alice", "pw"));
        let params = req.params("flow.example.com");

        let phone = params["PhoneNumber"].as_str().unwrap();
        assert_eq!(phone.len(), 15);
        assert!(phone.bytes().all(|b| b.is_ascii_digit()));

        let totp = params["TotpVerifier"].as_str().unwrap();
        assert_eq!(totp.len(), 15);

        let device = params["DeviceName"].as_str().unwrap();
        assert!(device.starts_with("dev-"));
        assert_eq!(device.len(), 4 + 15);

        assert_eq!(params["Username"], "alice");
        assert_eq!(params["ServerURI"], "flow.example.com");
        assert_eq!(params["NotifyToken"], "");
        assert_eq!(params["Platform"], host_platform());
        assert_eq!(req.method(), "CreateAccount");
    }

    #[test]
    fn test_random_defaults_differ_per_request() {
        let first = Onboarding::from(CreateAccount::new("alice", "pw")).params("flow.example.com");
        let second = Onboarding::from(CreateAccount::new("alice", "pw")).params("flow.example.com");
        assert_ne!(first["TotpVerifier"], second["TotpVerifier"]);
        assert_ne!(first["TotpVerifier"], first["PhoneNumber"]);

        let digits = random_digits(64);
        assert_eq!(digits.len(), 64);
        assert!(digits.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_explicit_fields_kept() {
        let req = Onboarding::from(
            CreateAccount::new("bob", "pw")
                .phone_number("5551234")
                .device_name("laptop")
                .totp_verifier("42"),
        );
        let params = req.params("uri");
        assert_eq!(params["PhoneNumber"], "5551234");
        assert_eq!(params["DeviceName"], "laptop");
        assert_eq!(params["TotpVerifier"], "42");
    }

    #[test]
    fn test_create_device_and_start_up_params() {
        let device = Onboarding::from(CreateDevice::new("carol", "pw"));
        let params = device.params("uri");
        assert_eq!(device.method(), "CreateDevice");
        assert!(params["DeviceName"].as_str().unwrap().starts_with("dev-"));
        assert!(params.get("PhoneNumber").is_none());

        let start = Onboarding::from(StartUp::new("carol"));
        assert_eq!(start.method(), "StartUp");
        assert_eq!(start.params("uri"), json!({"Username": "carol", "ServerURI": "uri"}));
    }

    #[test]
    fn test_validate() {
        assert!(Onboarding::from(StartUp::new("dave")).validate().is_ok());
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                Onboarding::from(StartUp::new(bad)).validate(),
                Err(FlowError::InvalidArgument(_))
            ));
        }
    }
}
