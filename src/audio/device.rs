//! # Host Audio Devices
//!
//! The bridge sees the host's sound system as two byte streams: a playback
//! sink it writes PCM into and a capture source it reads PCM from. By default
//! both are ALSA command-line tools (`aplay` / `arecord`) spawned per session,
//! which keeps the bridge independent of any particular sound server.
//!
//! Capture failures are survivable (the transmit worker switches to silence);
//! playback failures end the receive worker.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

use super::SampleRate;
use crate::config::AudioConfig;

/// Writable PCM sink handed to the receive worker.
pub type PlaybackStream = Box<dyn Write + Send>;

/// Readable PCM source handed to the transmit worker.
pub type CaptureStream = Box<dyn Read + Send>;

/// Opens per-session device streams at a given sample rate.
pub trait AudioDevices: Send + Sync {
    fn open_playback(&self, rate: SampleRate) -> io::Result<PlaybackStream>;
    fn open_capture(&self, rate: SampleRate) -> io::Result<CaptureStream>;
}

/// Devices backed by spawned commands reading stdin / writing stdout.
#[derive(Debug, Clone)]
pub struct CommandDevices {
    playback: Vec<String>,
    capture: Vec<String>,
}

impl CommandDevices {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            playback: config.playback_command.clone(),
            capture: config.capture_command.clone(),
        }
    }

    fn command(template: &[String], rate: SampleRate) -> io::Result<Command> {
        let (program, args) = template
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty device command"))?;
        let rate = rate.hz().to_string();
        let mut command = Command::new(program);
        command.args(args.iter().map(|arg| arg.replace("{rate}", &rate)));
        Ok(command)
    }
}

impl AudioDevices for CommandDevices {
    fn open_playback(&self, rate: SampleRate) -> io::Result<PlaybackStream> {
        let mut child = Self::command(&self.playback, rate)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "playback stdin unavailable"))?;
        info!(pid = child.id(), rate = rate.hz(), "Playback device started");
        Ok(Box::new(ChildSink {
            stdin: Some(stdin),
            child: ChildGuard(child),
        }))
    }

    fn open_capture(&self, rate: SampleRate) -> io::Result<CaptureStream> {
        let mut child = Self::command(&self.capture, rate)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "capture stdout unavailable"))?;
        info!(pid = child.id(), rate = rate.hz(), "Capture device started");
        Ok(Box::new(ChildSource {
            stdout,
            child: ChildGuard(child),
        }))
    }
}

/// Kills and reaps the device process when the stream goes away.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let pid = self.0.id();
        if let Err(e) = self.0.kill() {
            // Already exited is the common case here
            debug!(pid, error = %e, "Device process kill");
        }
        match self.0.wait() {
            Ok(status) => debug!(pid, %status, "Device process reaped"),
            Err(e) => warn!(pid, error = %e, "Could not reap device process"),
        }
    }
}

struct ChildSink {
    // Dropped before the guard so the child sees EOF first
    stdin: Option<ChildStdin>,
    child: ChildGuard,
}

impl Write for ChildSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ChildSink {
    fn drop(&mut self) {
        self.stdin.take();
        debug!(pid = self.child.0.id(), "Closing playback device");
    }
}

struct ChildSource {
    stdout: ChildStdout,
    child: ChildGuard,
}

impl Read for ChildSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildSource {
    fn drop(&mut self) {
        debug!(pid = self.child.0.id(), "Closing capture device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(playback: &[&str], capture: &[&str]) -> CommandDevices {
        CommandDevices {
            playback: playback.iter().map(|s| s.to_string()).collect(),
            capture: capture.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_rate_placeholder_is_substituted() {
        let command = CommandDevices::command(
            &["arecord".to_string(), "-r".to_string(), "{rate}".to_string()],
            SampleRate::Wide,
        )
        .unwrap();
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-r", "16000"]);
    }

    #[test]
    fn test_capture_reads_command_output() {
        let devices = devices(&["cat"], &["printf", "abcd"]);
        let mut capture = devices.open_capture(SampleRate::Narrow).unwrap();
        let mut out = Vec::new();
        capture.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_playback_accepts_writes() {
        let devices = devices(&["cat"], &["true"]);
        let mut playback = devices.open_playback(SampleRate::Narrow).unwrap();
        playback.write_all(&[0u8; 320]).unwrap();
        playback.flush().unwrap();
    }

    #[test]
    fn test_missing_program_fails_to_open() {
        let devices = devices(&["/nonexistent/aplay"], &["/nonexistent/arecord"]);
        assert!(devices.open_playback(SampleRate::Wide).is_err());
        assert!(devices.open_capture(SampleRate::Wide).is_err());
    }
}
