//! Device dialer driven by an idle manager.

use async_trait::async_trait;
use bytes::Bytes;
use devlink_idle::{IdleReset, Managed};
use devlink_session::{dial_tcp, Link, SessionError, StreamTransport, TlsVersion};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(feature = "tls")]
use devlink_session::dial_tls;

use crate::config::{DeviceConfig, LoginConfig};

/// Dials one device, logging in when configured
#[derive(Debug, Clone)]
pub struct DeviceDialer {
    address: String,
    tls: Option<TlsVersion>,
    timeout: Duration,
    prompts: Vec<String>,
    login: Option<LoginConfig>,
}

impl DeviceDialer {
    pub fn from_config(config: &DeviceConfig) -> anyhow::Result<Self> {
        let tls = config
            .tls_version
            .as_deref()
            .map(str::parse::<TlsVersion>)
            .transpose()?;

        Ok(Self {
            address: config.address.clone(),
            tls,
            timeout: config.timeout,
            prompts: config.prompts.clone(),
            login: config.login.clone(),
        })
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    async fn dial(&self) -> anyhow::Result<StreamTransport> {
        match self.tls {
            None => Ok(dial_tcp(&self.address, self.timeout).await?),
            #[cfg(feature = "tls")]
            Some(version) => Ok(dial_tls(&self.address, version, self.timeout).await?),
            #[cfg(not(feature = "tls"))]
            Some(version) => anyhow::bail!(
                "TLS {} requested but devlink-probe was built without the tls feature",
                version
            ),
        }
    }

    async fn log_in(&self, link: &Link, login: &LoginConfig) -> Result<(), SessionError> {
        let mut session = link.session().await;
        debug!(parent: session.span(), "Logging in as {}", login.username);

        session.read_until(&[&login.user_prompt]).await?;
        session.send(login.username.as_bytes()).await;
        session.send(b"\r\n").await;

        session.read_until(&[&login.password_prompt]).await?;
        session.send_sensitive(login.password.as_bytes()).await;
        session.send_sensitive(b"\r\n").await;

        session.read_until(self.prompts.as_slice()).await?;
        session.release();
        Ok(())
    }
}

#[async_trait]
impl Managed for DeviceDialer {
    type Conn = Link;

    async fn connect(&self, idle: IdleReset) -> anyhow::Result<Link> {
        let transport = self.dial().await?;
        let link = Link::new(Arc::new(transport), idle);

        if let Some(login) = &self.login {
            if let Err(e) = self.log_in(&link, login).await {
                warn!("Login to {} failed: {}", self.address, e);
                if let Err(close_err) = link.close().await {
                    debug!("Closing after failed login: {}", close_err);
                }
                return Err(e.into());
            }
            info!("Logged in to {} as {}", self.address, login.username);
        }

        Ok(link)
    }

    async fn disconnect(&self, link: Link) -> anyhow::Result<()> {
        link.close().await?;
        info!("Disconnected from {}", self.address);
        Ok(())
    }
}

/// Run one command as an exclusive session and return its output up to the prompt
pub async fn run_command<S: AsRef<[u8]>>(
    link: &Link,
    command: &str,
    prompts: &[S],
) -> Result<Bytes, SessionError> {
    let mut session = link.session().await;
    debug!(parent: session.span(), "Running {:?}", command);

    session.send(command.as_bytes()).await;
    session.send(b"\r\n").await;
    let output = session.read_until(prompts).await;

    session.release();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_idle::OnDemandConnection;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Fake device: login/password exchange, then echoes each command line.
    /// Sends every line it receives on the returned channel.
    async fn fake_device(password: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = socket.into_split();
                    let mut lines = BufReader::new(reader).lines();

                    writer.write_all(b"login: ").await.unwrap();
                    let user = lines.next_line().await.unwrap().unwrap_or_default();
                    let _ = tx.send(user.trim_end().to_string());

                    writer.write_all(b"Password: ").await.unwrap();
                    let pass = lines.next_line().await.unwrap().unwrap_or_default();
                    let _ = tx.send(pass.trim_end().to_string());
                    if pass.trim_end() != password {
                        return;
                    }

                    writer.write_all(b"\r\nrouter# ").await.unwrap();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let line = line.trim_end().to_string();
                        let _ = tx.send(line.clone());
                        let reply = format!("echo: {}\r\nrouter# ", line);
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, rx)
    }

    fn config(addr: &str) -> DeviceConfig {
        DeviceConfig {
            address: addr.to_string(),
            timeout: Duration::from_secs(2),
            prompts: vec!["router# ".to_string()],
            login: Some(LoginConfig {
                username: "admin".to_string(),
                password: "secret".to_string(),
                user_prompt: "login: ".to_string(),
                password_prompt: "Password: ".to_string(),
            }),
            ..DeviceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_login_and_run_command() {
        let (addr, mut seen) = fake_device("secret").await;
        let dialer = DeviceDialer::from_config(&config(&addr)).unwrap();
        let prompts = dialer.prompts().to_vec();
        let conn = OnDemandConnection::new(dialer, Link::failed);

        let link = conn.connection().await;
        assert!(link.err().is_none());
        let output = run_command(&link, "show clock", &prompts).await.unwrap();
        assert_eq!(&output[..], b"echo: show clock\r\nrouter# ");

        assert_eq!(seen.recv().await.unwrap(), "admin");
        assert_eq!(seen.recv().await.unwrap(), "secret");
        assert_eq!(seen.recv().await.unwrap(), "show clock");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_login_yields_failed_link() {
        let (addr, _seen) = fake_device("other").await;
        let dialer = DeviceDialer::from_config(&config(&addr)).unwrap();
        let conn = OnDemandConnection::new(dialer, Link::failed);

        let link = conn.connection().await;
        assert!(link.err().is_some());

        let err = run_command(&link, "show clock", &["router# "]).await.unwrap_err();
        assert_eq!(err.to_string(), link.err().unwrap().to_string());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_device_yields_failed_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = DeviceDialer::from_config(&DeviceConfig {
            address: addr,
            ..DeviceConfig::default()
        })
        .unwrap();
        let conn = OnDemandConnection::new(dialer, Link::failed);

        let link = conn.connection().await;
        assert!(link.err().is_some());
    }

    #[test]
    fn test_unknown_tls_version_rejected() {
        let err = DeviceDialer::from_config(&DeviceConfig {
            tls_version: Some("1.1".to_string()),
            ..DeviceConfig::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("1.1"));
    }
}
