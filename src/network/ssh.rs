//! SSH identity, agent socket, and clients for reaching guests.

use anyhow::{Context, Result};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dialer::Dialer;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "core";
const KEY_COMMENT: &str = "core@default";

/// An ephemeral SSH identity served over an agent socket.
///
/// Guests get the public key through their first-boot config; host-side
/// tools (and forwarded sessions) use the agent at [`socket`](Self::socket).
pub struct SshAgent {
    key: Arc<KeyPair>,
    dialer: Arc<dyn Dialer>,
    user: String,
    socket: PathBuf,
    owned_dir: Mutex<Option<TempDir>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl SshAgent {
    /// Generate a key and start serving it.
    ///
    /// With `ssh_dir` the socket goes there and the directory is left alone
    /// on close; otherwise a private temp directory is created and removed.
    pub async fn new(dialer: Arc<dyn Dialer>, ssh_dir: Option<&Path>) -> Result<Self> {
        let key = KeyPair::Ed25519(ed25519_dalek::SigningKey::generate(
            &mut rand::rngs::OsRng,
        ));

        let (sock_dir, owned_dir) = match ssh_dir {
            Some(dir) => (dir.to_path_buf(), None),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("vmflight-ssh-")
                    .tempdir()
                    .context("creating SSH agent directory")?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        // Same naming scheme as ssh-agent.
        let socket = sock_dir.join(format!("agent.{}", std::process::id()));
        if socket.exists() {
            debug!(socket = %socket.display(), "removing stale agent socket");
            std::fs::remove_file(&socket)
                .with_context(|| format!("removing stale socket {}", socket.display()))?;
        }
        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("binding agent socket {}", socket.display()))?;

        let server = tokio::spawn(async move {
            let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
            if let Err(e) = russh_keys::agent::server::serve(incoming, ()).await {
                warn!(error = %e, "SSH agent server stopped");
            }
        });

        let agent = Self {
            key: Arc::new(key),
            dialer,
            user: DEFAULT_USER.to_string(),
            socket,
            owned_dir: Mutex::new(owned_dir),
            server: Mutex::new(Some(server)),
        };

        if let Err(e) = agent.load_key().await {
            let _ = agent.close();
            return Err(e);
        }

        info!(socket = %agent.socket.display(), "SSH agent started");
        Ok(agent)
    }

    async fn load_key(&self) -> Result<()> {
        let mut client = AgentClient::connect_uds(&self.socket)
            .await
            .context("connecting to SSH agent")?;
        client
            .add_identity(&self.key, &[])
            .await
            .context("adding key to SSH agent")?;
        Ok(())
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        self.key
            .clone_public_key()
            .context("deriving SSH public key")
    }

    /// authorized_keys lines for the agent's identities.
    pub fn public_keys(&self) -> Result<Vec<String>> {
        let pk = self.public_key()?;
        Ok(vec![format!(
            "{} {} {}",
            pk.name(),
            pk.public_key_base64(),
            KEY_COMMENT
        )])
    }

    pub async fn new_client(&self, host: &str) -> Result<SshClient> {
        self.new_user_client(host, &self.user).await
    }

    pub async fn new_user_client(&self, host: &str, user: &str) -> Result<SshClient> {
        let mut handle = self.connect(host).await?;
        let ok = handle
            .authenticate_publickey(user, self.key.clone())
            .await
            .with_context(|| format!("authenticating to {} as {}", host, user))?;
        if !ok {
            anyhow::bail!("public key rejected by {} for {}", host, user);
        }
        Ok(SshClient { handle })
    }

    pub async fn new_password_client(
        &self,
        host: &str,
        user: &str,
        password: &str,
    ) -> Result<SshClient> {
        let mut handle = self.connect(host).await?;
        let ok = handle
            .authenticate_password(user, password)
            .await
            .with_context(|| format!("authenticating to {} as {}", host, user))?;
        if !ok {
            anyhow::bail!("password rejected by {} for {}", host, user);
        }
        Ok(SshClient { handle })
    }

    async fn connect(&self, host: &str) -> Result<client::Handle<ClientHandler>> {
        let addr = ensure_port_suffix(host, DEFAULT_PORT);
        let stream = self
            .dialer
            .dial(&addr)
            .await
            .with_context(|| format!("dialing {}", addr))?;

        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            agent_socket: self.socket.clone(),
        };
        client::connect_stream(config, stream, handler)
            .await
            .with_context(|| format!("SSH handshake with {}", addr))
    }

    /// Stop serving and remove the socket directory if this agent created it.
    pub fn close(&self) -> Result<()> {
        let server = self
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(server) = server else {
            return Ok(());
        };
        server.abort();

        let owned = self
            .owned_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match owned {
            Some(dir) => dir.close().context("removing SSH agent directory")?,
            None => {
                if let Err(e) = std::fs::remove_file(&self.socket) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e).context("removing agent socket");
                    }
                }
            }
        }
        debug!("SSH agent closed");
        Ok(())
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %format!("{:#}", e), "closing SSH agent on drop");
        }
    }
}

pub struct ClientHandler {
    agent_socket: PathBuf,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Guests are throwaway; their host keys are never verified.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let socket = self.agent_socket.clone();
        tokio::spawn(async move {
            let mut agent = match tokio::net::UnixStream::connect(&socket).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "connecting forwarded agent channel");
                    return;
                }
            };
            let mut stream = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut agent).await {
                debug!(error = %e, "forwarded agent channel closed");
            }
        });
        Ok(())
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the server closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

pub struct SshClient {
    handle: client::Handle<ClientHandler>,
}

impl SshClient {
    /// Run `cmd` in a fresh session with agent forwarding.
    ///
    /// Output is trimmed of surrounding whitespace.
    pub async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("opening SSH session")?;
        channel
            .agent_forward(false)
            .await
            .context("requesting agent forwarding")?;
        channel.exec(true, cmd).await.context("starting remote command")?;

        let mut out = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => out.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    out.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        out.stdout = out.stdout.trim_ascii().to_vec();
        out.stderr = out.stderr.trim_ascii().to_vec();
        Ok(out)
    }

    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .context("disconnecting SSH client")
    }
}

/// Append `:port` unless `host` already names one. Bare IPv6 gets bracketed.
pub fn ensure_port_suffix(host: &str, port: u16) -> String {
    if !host.contains(':') {
        format!("{}:{}", host, port)
    } else if host.starts_with('[') && host.ends_with(']') {
        format!("{}:{}", host, port)
    } else if host.starts_with('[') && host.contains("]:") {
        host.to_string()
    } else if host.matches(':').count() > 1 {
        format!("[{}]:{}", host, port)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dialer::TcpDialer;

    #[test]
    fn test_ensure_port_suffix() {
        for (host, want) in [
            ("10.0.0.2", "10.0.0.2:22"),
            ("10.0.0.2:2222", "10.0.0.2:2222"),
            ("[fd00::2]", "[fd00::2]:22"),
            ("[fd00::2]:2222", "[fd00::2]:2222"),
            ("fd00::2", "[fd00::2]:22"),
            ("localhost", "localhost:22"),
        ] {
            assert_eq!(ensure_port_suffix(host, 22), want, "host {}", host);
        }
    }

    #[tokio::test]
    async fn test_agent_owned_dir_removed_on_close() {
        let agent = SshAgent::new(Arc::new(TcpDialer), None).await.unwrap();
        let socket = agent.socket().to_path_buf();
        let dir = socket.parent().unwrap().to_path_buf();
        assert!(socket.exists());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("vmflight-ssh-"));

        agent.close().unwrap();
        assert!(!dir.exists());
        // Idempotent.
        agent.close().unwrap();
    }

    #[tokio::test]
    async fn test_agent_override_dir_kept_and_stale_socket_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let stale = dir.path().join(format!("agent.{}", std::process::id()));
        std::fs::write(&stale, b"stale").unwrap();

        let agent = SshAgent::new(Arc::new(TcpDialer), Some(dir.path()))
            .await
            .unwrap();
        assert_eq!(agent.socket(), stale);

        agent.close().unwrap();
        assert!(dir.path().exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_agent_serves_generated_key() {
        let agent = SshAgent::new(Arc::new(TcpDialer), None).await.unwrap();

        let lines = agent.public_keys().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ssh-ed25519 "));
        assert!(lines[0].ends_with(" core@default"));
        assert_eq!(agent.user(), "core");

        let mut client = AgentClient::connect_uds(agent.socket()).await.unwrap();
        let ids = client.request_identities().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(
            ids[0].public_key_base64(),
            agent.public_key().unwrap().public_key_base64()
        );

        agent.close().unwrap();
    }
}
