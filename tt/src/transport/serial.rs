//! Serial device access
//!
//! The device is opened once and configured raw 8N1 at the requested baud
//! rate with blocking reads (VMIN=1, VTIME=0). Read and write halves are
//! separate handles so a pending read never holds up a write.

use std::path::Path;

use tokio::fs::File;

use crate::error::TransportError;

#[cfg(unix)]
pub(super) fn open(path: &Path, baud_rate: u32) -> Result<(File, File), TransportError> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices};
    use tracing::debug;

    let open_err = |source: std::io::Error| TransportError::Open {
        target: path.display().to_string(),
        source,
    };

    let speed = baud(baud_rate).ok_or_else(|| TransportError::Unsupported(format!("baud rate {baud_rate}")))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NOCTTY)
        .open(path)
        .map_err(open_err)?;

    let mut tio = termios::tcgetattr(&file).map_err(|e| open_err(e.into()))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, speed).map_err(|e| open_err(e.into()))?;
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    tio.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::PARENB);
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(|e| open_err(e.into()))?;
    debug!(path = %path.display(), baud_rate, "serial::open: configured raw 8N1");

    let reader = file.try_clone().map_err(open_err)?;
    Ok((File::from_std(reader), File::from_std(file)))
}

#[cfg(unix)]
fn baud(rate: u32) -> Option<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate;

    match rate {
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        _ => None,
    }
}

#[cfg(not(unix))]
pub(super) fn open(path: &Path, _baud_rate: u32) -> Result<(File, File), TransportError> {
    Err(TransportError::Unsupported(format!(
        "serial device {} (use a tcp:// target on this platform)",
        path.display()
    )))
}
