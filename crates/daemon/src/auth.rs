// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Authentication Module
// Applies a session's auth material to a fresh SSH handle, asking the
// auth context for anything the session does not store

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use sshtunnel_common::{AuthMethod, AuthRequest, AuthRequestType, Session};

use crate::debug_log::SessionLog;
use crate::error::{AuthError, TransportError};

/// Source of credentials and confirmations for one connect attempt
#[async_trait]
pub trait AuthContext: Send + Sync {
    /// Ask the user for input and wait for the answer
    async fn request_input(&self, request: AuthRequest) -> Result<Zeroizing<String>, AuthError>;
}

/// Auth context for unattended use: every request fails
pub struct NonInteractive;

#[async_trait]
impl AuthContext for NonInteractive {
    async fn request_input(&self, request: AuthRequest) -> Result<Zeroizing<String>, AuthError> {
        debug!(
            "No interactive input for {:?} on session {}",
            request.auth_type, request.session_name
        );
        Err(AuthError::Unavailable)
    }
}

/// Shorthand used by the transport and the manager
pub fn non_interactive() -> Arc<dyn AuthContext> {
    Arc::new(NonInteractive)
}

pub(crate) async fn request(
    ctx: &dyn AuthContext,
    session: &Session,
    auth_type: AuthRequestType,
    prompt: String,
    hidden: bool,
) -> Result<Zeroizing<String>, AuthError> {
    ctx.request_input(AuthRequest {
        session_name: session.name.clone(),
        auth_type,
        prompt,
        hidden,
    })
    .await
}

/// Await one authentication exchange with the server, bounded by `limit`
async fn round_trip<T, F>(limit: Duration, exchange: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, russh::Error>>,
{
    match tokio::time::timeout(limit, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::AuthTimeout(limit)),
    }
}

/// Authenticate with the SSH server using the session's auth method.
///
/// Every server round trip is bounded by `limit`; time spent waiting on the
/// auth context for user input is not.
pub async fn authenticate<H: client::Handler>(
    handle: &mut Handle<H>,
    session: &Session,
    ctx: &dyn AuthContext,
    log: &SessionLog,
    limit: Duration,
) -> Result<(), TransportError> {
    let user = session.username.as_str();

    match &session.auth {
        AuthMethod::IdentityFile { path, passphrase } => {
            info!("Authenticating with key: {}", path.display());
            log.info(format!("Authenticating {} with key {}", user, path.display()));
            let key = load_identity(path, passphrase.as_deref(), session, ctx).await?;
            if authenticate_with_key(handle, user, key, limit).await? {
                return Ok(());
            }

            // Key accepted but the server wants more (e.g. 2FA)
            info!("Key authentication partial success, attempting keyboard-interactive");
            authenticate_keyboard_interactive(handle, session, ctx, limit).await
        }
        AuthMethod::Password { password } => {
            info!("Authenticating with password");
            log.info(format!("Authenticating {} with password", user));
            let password = match password.as_deref().filter(|p| !p.trim().is_empty()) {
                Some(stored) => Zeroizing::new(stored.to_string()),
                None => prompt_password(session, ctx).await?,
            };
            authenticate_with_password(handle, user, &password, limit).await
        }
        AuthMethod::None => {
            log.info(format!("Authenticating {} with method none", user));
            match round_trip(limit, handle.authenticate_none(user)).await? {
                AuthResult::Success => Ok(()),
                AuthResult::Failure {
                    remaining_methods, ..
                } => {
                    let methods: Vec<String> = remaining_methods
                        .iter()
                        .map(|m| {
                            let s: &str = m.into();
                            s.to_string()
                        })
                        .collect();
                    debug!("Server offers: {}", methods.join(", "));

                    if methods.iter().any(|m| m == "keyboard-interactive") {
                        authenticate_keyboard_interactive(handle, session, ctx, limit).await
                    } else if methods.iter().any(|m| m == "password") {
                        let password = prompt_password(session, ctx).await?;
                        authenticate_with_password(handle, user, &password, limit).await
                    } else {
                        let msg = format!(
                            "No usable authentication method. Server requires: {}",
                            methods.join(", ")
                        );
                        error!("{}", msg);
                        Err(TransportError::Authentication(msg))
                    }
                }
            }
        }
    }
}

async fn prompt_password(
    session: &Session,
    ctx: &dyn AuthContext,
) -> Result<Zeroizing<String>, TransportError> {
    let prompt = format!("Password for {}@{}: ", session.username, session.hostname);
    Ok(request(ctx, session, AuthRequestType::Password, prompt, true).await?)
}

/// Load the identity file, prompting for a passphrase when the key is encrypted
async fn load_identity(
    path: &Path,
    stored_passphrase: Option<&str>,
    session: &Session,
    ctx: &dyn AuthContext,
) -> Result<PrivateKey, TransportError> {
    let key_error = |e: russh::keys::Error| TransportError::Key {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(passphrase) = stored_passphrase.filter(|p| !p.trim().is_empty()) {
        return load_secret_key(path, Some(passphrase)).map_err(key_error);
    }

    match load_secret_key(path, None) {
        Ok(key) => Ok(key),
        Err(e) => {
            let err_str = e.to_string().to_lowercase();
            if err_str.contains("encrypted")
                || err_str.contains("passphrase")
                || err_str.contains("decrypt")
            {
                info!("Key is encrypted, requesting passphrase");
                let passphrase = request(
                    ctx,
                    session,
                    AuthRequestType::KeyPassphrase,
                    format!("Enter passphrase for key '{}': ", path.display()),
                    true,
                )
                .await?;
                load_secret_key(path, Some(passphrase.as_str())).map_err(key_error)
            } else {
                Err(key_error(e))
            }
        }
    }
}

/// Returns `Ok(false)` when the key was accepted but more authentication is required
async fn authenticate_with_key<H: client::Handler>(
    handle: &mut Handle<H>,
    user: &str,
    key: PrivateKey,
    limit: Duration,
) -> Result<bool, TransportError> {
    // Hash algorithm only matters for RSA keys
    let rsa_hash = round_trip(limit, handle.best_supported_rsa_hash()).await?.flatten();
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash);

    match round_trip(limit, handle.authenticate_publickey(user, key_with_alg)).await? {
        AuthResult::Success => Ok(true),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();

            if partial_success {
                info!(
                    "Public key accepted, server requires additional authentication: {}",
                    methods.join(", ")
                );
                Ok(false)
            } else {
                let msg = format!(
                    "Public key authentication rejected. {}",
                    describe_methods(&methods)
                );
                error!("{}", msg);
                Err(TransportError::Authentication(msg))
            }
        }
    }
}

async fn authenticate_with_password<H: client::Handler>(
    handle: &mut Handle<H>,
    user: &str,
    password: &str,
    limit: Duration,
) -> Result<(), TransportError> {
    match round_trip(limit, handle.authenticate_password(user, password)).await? {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();

            let msg = if partial_success {
                format!(
                    "Password authentication partially successful. {} to complete authentication",
                    describe_methods(&methods)
                )
            } else {
                format!("Password authentication rejected. {}", describe_methods(&methods))
            };
            error!("{}", msg);
            Err(TransportError::Authentication(msg))
        }
    }
}

/// Keyboard-interactive authentication; every prompt goes through the auth context
async fn authenticate_keyboard_interactive<H: client::Handler>(
    handle: &mut Handle<H>,
    session: &Session,
    ctx: &dyn AuthContext,
    limit: Duration,
) -> Result<(), TransportError> {
    let user = session.username.as_str();
    info!("Attempting keyboard-interactive authentication for user: {}", user);

    let mut response = round_trip(
        limit,
        handle.authenticate_keyboard_interactive_start(user, None::<String>),
    )
    .await?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("Keyboard-interactive authentication successful");
                return Ok(());
            }

            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                let methods: Vec<String> = remaining_methods
                    .iter()
                    .map(|m| {
                        let s: &str = m.into();
                        s.to_string()
                    })
                    .collect();

                let msg = if partial_success {
                    format!(
                        "Keyboard-interactive authentication partially successful. {} to complete authentication",
                        describe_methods(&methods)
                    )
                } else {
                    format!(
                        "Keyboard-interactive authentication rejected. {}",
                        describe_methods(&methods)
                    )
                };
                error!("{}", msg);
                return Err(TransportError::Authentication(msg));
            }

            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                debug!(
                    "Keyboard-interactive: info request: name={:?}, instructions={:?}, prompts={}",
                    name,
                    instructions,
                    prompts.len()
                );

                // Zero prompts is answered with zero responses
                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in &prompts {
                    let mut full_prompt = String::new();
                    if !name.trim().is_empty() {
                        full_prompt.push_str(&name);
                        full_prompt.push('\n');
                    }
                    if !instructions.trim().is_empty() {
                        full_prompt.push_str(&instructions);
                        full_prompt.push('\n');
                    }
                    full_prompt.push_str(&prompt.prompt);

                    // echo == false means sensitive input
                    let answer = request(
                        ctx,
                        session,
                        AuthRequestType::KeyboardInteractive,
                        full_prompt,
                        !prompt.echo,
                    )
                    .await?;
                    answers.push(answer.as_str().to_string());
                }

                response = round_trip(
                    limit,
                    handle.authenticate_keyboard_interactive_respond(answers),
                )
                .await?;
            }
        }
    }
}

fn describe_methods(methods: &[String]) -> String {
    if methods.is_empty() {
        "No authentication methods available".to_string()
    } else {
        format!("Server requires: {}", methods.join(", "))
    }
}
