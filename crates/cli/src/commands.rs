//! CLI commands

use anyhow::{Result, bail};
use clap::Subcommand;
use lectern_core::{SessionConfig, UserProfile};
use lectern_http::{ApiRequest, ClientError, Credentials, Registration, SessionClient};
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,

        #[arg(long, env = "LECTERN_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account and sign in
    Signup {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long, env = "LECTERN_PASSWORD", hide_env_values = true)]
        password: String,

        /// Program to enroll through
        #[arg(long)]
        program_type: Option<String>,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Show the signed-in user
    Whoami {
        /// Ask the server instead of reading the stored profile
        #[arg(long)]
        remote: bool,
    },

    /// Show the state of the stored session
    Status,

    /// Refresh the access token if it is about to expire
    Refresh {
        /// Refresh even if the current token is still fresh
        #[arg(long)]
        force: bool,
    },

    /// Send an authorized GET request and print the response
    Get {
        /// Path relative to the API base URL
        path: String,

        /// Query parameter as key=value, repeatable
        #[arg(short, long = "query", value_parser = parse_key_val)]
        query: Vec<(String, String)>,
    },

    /// Keep the session alive and report expiry until interrupted
    Watch,
}

impl Commands {
    /// Whether the command runs until interrupted
    pub fn is_long_running(&self) -> bool {
        matches!(self, Commands::Watch)
    }

    pub async fn execute(self, client: SessionClient, config: SessionConfig) -> Result<()> {
        match self {
            Commands::Login { email, password } => {
                let session = client.login(&Credentials { email, password }).await?;
                println!("Signed in as {}", describe(session.user.as_ref()));
                Ok(())
            }
            Commands::Signup {
                name,
                email,
                password,
                program_type,
            } => {
                let registration = Registration {
                    name,
                    email,
                    password,
                    program_type,
                };
                let session = client.signup(&registration).await?;
                println!("Account created, signed in as {}", describe(session.user.as_ref()));
                Ok(())
            }
            Commands::Logout => {
                client.logout().await?;
                println!("Signed out");
                Ok(())
            }
            Commands::Whoami { remote } => whoami(&client, remote).await,
            Commands::Status => {
                status(&client);
                Ok(())
            }
            Commands::Refresh { force } => {
                if client.coordinator().ensure_valid(force).await {
                    status(&client);
                    Ok(())
                } else {
                    bail!("No usable session; run `lectern login`")
                }
            }
            Commands::Get { path, query } => get(&client, path, query).await,
            Commands::Watch => watch(&client, &config).await,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

fn describe(user: Option<&UserProfile>) -> String {
    match user {
        Some(user) => match (&user.name, &user.email) {
            (Some(name), Some(email)) => format!("{name} <{email}>"),
            (Some(name), None) => name.clone(),
            (None, Some(email)) => email.clone(),
            (None, None) => format!("user {}", user.id),
        },
        None => "unknown user".to_string(),
    }
}

async fn whoami(client: &SessionClient, remote: bool) -> Result<()> {
    let user = if remote {
        Some(client.current_user().await?)
    } else {
        client.store().user()
    };

    let Some(user) = user else {
        bail!("Not signed in");
    };

    println!("{}", describe(Some(&user)));
    println!("  id:   {}", user.id);
    if let Some(role) = &user.role {
        println!("  role: {role}");
    }
    if let Some(program_type) = client.store().program_type() {
        println!("  program: {program_type}");
    }
    Ok(())
}

fn status(client: &SessionClient) {
    let session = client.store().snapshot();
    let inspector = client.coordinator().inspector();

    let Some(token) = session.access_token.as_deref() else {
        println!("Not signed in");
        if session.refresh_token.is_some() {
            println!("  a refresh token is stored; run `lectern refresh` to resume");
        }
        return;
    };

    println!("Signed in as {}", describe(session.user.as_ref()));
    match inspector.expires_at(token) {
        Some(expires_at) => {
            let state = if inspector.is_expired(Some(token)) {
                "expired"
            } else if inspector.is_expiring_soon(Some(token)) {
                "expiring soon"
            } else {
                "valid"
            };
            println!(
                "  access token: {state}, expires {} ({} min left)",
                expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                inspector.minutes_until_expiry(Some(token))
            );
        }
        None => println!("  access token: unreadable, treated as expired"),
    }
    println!(
        "  refresh token: {}",
        if session.refresh_token.is_some() {
            "present"
        } else {
            "missing"
        }
    );
    if let Some(program_type) = &session.program_type {
        println!("  program: {program_type}");
    }
}

async fn get(client: &SessionClient, path: String, query: Vec<(String, String)>) -> Result<()> {
    let request = query
        .into_iter()
        .fold(ApiRequest::get(path), |request, (key, value)| {
            request.query(key, value)
        });

    let response = client.send(request).await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(ClientError::from_status(status, body).into());
    }

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}

async fn watch(client: &SessionClient, config: &SessionConfig) -> Result<()> {
    if client.store().snapshot().is_empty() {
        bail!("Not signed in");
    }

    let interval = config.expiry.check_interval();
    info!(interval_secs = interval.as_secs(), "Watching session");
    let handle = client.expiry_notifier(&config.expiry).spawn(interval);
    let mut updates = client.store().subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = updates.borrow_and_update().clone();
                if session.is_empty() {
                    println!("Session ended");
                    break;
                }
                if session.is_authenticated() {
                    status(client);
                }
            }
        }
    }

    handle.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("page=2"),
            Ok(("page".to_string(), "2".to_string()))
        );
        assert_eq!(
            parse_key_val("filter=a=b"),
            Ok(("filter".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_val("page").is_err());
    }

    #[test]
    fn test_describe_prefers_name_and_email() {
        let user = UserProfile {
            id: "7".to_string(),
            name: Some("Grace".to_string()),
            email: Some("grace@example.com".to_string()),
            role: None,
            avatar: None,
        };
        assert_eq!(describe(Some(&user)), "Grace <grace@example.com>");
        assert_eq!(describe(None), "unknown user");
    }
}
