use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Default address of the arbitrary waveform generator used as reference source.
pub const DEFAULT_PULSER_ADDRESS: &str = "aimtti-tgp3152-00";

/// Default location of the pulser command line client.
pub const DEFAULT_PULSER_PROGRAM: &str = "/eu/aimtti/aimtti-cmd.py";

const SOCKET_REPLY_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum PulserError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pulser command '{command}' failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Pulser rejected voltage {volts} V: {reason}")]
    InvalidVoltage { volts: f64, reason: &'static str },

    #[error("Pulser reply is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A programmable voltage source driven by text commands.
///
/// Only [`Pulser::send_command`] is transport specific; the DC helpers build
/// the command strings understood by the generator.
pub trait Pulser {
    /// Send one command and return the instrument's reply.
    fn send_command(&mut self, command: &str) -> Result<String, PulserError>;

    /// Switch the output to a flat DC level at 0 V.
    fn configure_dc_output(&mut self) -> Result<(), PulserError> {
        for command in ["WAVE ARB", "ARBLOAD DC", "DCOFFS 0"] {
            self.send_command(command)?;
        }
        Ok(())
    }

    fn set_dc_offset(&mut self, volts: f64) -> Result<(), PulserError> {
        if !volts.is_finite() {
            return Err(PulserError::InvalidVoltage {
                volts,
                reason: "not a finite number",
            });
        }
        self.send_command(&format!("DCOFFS {volts}"))?;
        Ok(())
    }
}

impl<P: Pulser + ?Sized> Pulser for Box<P> {
    fn send_command(&mut self, command: &str) -> Result<String, PulserError> {
        (**self).send_command(command)
    }
}

/// Drives the pulser through its command line client, one process per command.
#[derive(Debug, Clone)]
pub struct CommandPulser {
    program: PathBuf,
    address: String,
}

impl CommandPulser {
    pub fn new(program: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            address: address.into(),
        }
    }
}

impl Default for CommandPulser {
    fn default() -> Self {
        Self::new(DEFAULT_PULSER_PROGRAM, DEFAULT_PULSER_ADDRESS)
    }
}

impl Pulser for CommandPulser {
    fn send_command(&mut self, command: &str) -> Result<String, PulserError> {
        log::debug!(
            "Running {} --address {} --cmd '{}'",
            self.program.display(),
            self.address,
            command
        );

        let output = Command::new(&self.program)
            .arg("--address")
            .arg(&self.address)
            .arg("--cmd")
            .arg(command)
            .output()?;

        if !output.status.success() {
            return Err(PulserError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let reply = String::from_utf8(output.stdout)?;
        Ok(reply.trim().to_string())
    }
}

/// Talks to the pulser server directly over its unix socket.
///
/// The server accepts one command per connection and answers with a single
/// reply of at most 1024 bytes.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct SocketPulser {
    socket_path: PathBuf,
    timeout: Duration,
}

#[cfg(unix)]
impl SocketPulser {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(1),
        }
    }

    /// Socket served for the instrument at `address`.
    pub fn for_address(address: &str) -> Self {
        Self::new(format!("/tmp/tti_server_{address}.socket"))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(unix)]
impl Pulser for SocketPulser {
    fn send_command(&mut self, command: &str) -> Result<String, PulserError> {
        use std::os::unix::net::UnixStream;

        log::debug!("Sending '{}' to {}", command, self.socket_path.display());

        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(command.as_bytes())?;

        let mut reply = vec![0u8; SOCKET_REPLY_LIMIT];
        let len = stream.read(&mut reply)?;
        reply.truncate(len);

        let reply = String::from_utf8(reply)?;
        log::debug!("Pulser replied '{}'", reply.trim());
        Ok(reply.trim().to_string())
    }
}
