//! Helpers for spawning job subprocesses.
//!
//! Jobs carry a single command string. These helpers turn that string into a
//! platform shell invocation (`sh -c` on Unix, `cmd /C` on Windows) and make
//! sure no console window flashes up on Windows hosts.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Program and leading arguments used to hand a script to the platform shell.
#[cfg(not(windows))]
pub const SHELL: (&str, &str) = ("sh", "-c");

/// Program and leading arguments used to hand a script to the platform shell.
#[cfg(windows)]
pub const SHELL: (&str, &str) = ("cmd", "/C");

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Build a blocking `std::process::Command` that runs `script` through the platform shell.
pub fn std_shell_command(script: impl AsRef<OsStr>) -> std::process::Command {
    let (program, flag) = SHELL;
    let mut cmd = std::process::Command::new(program);
    cmd.arg(flag).arg(script);
    cmd.no_window();
    cmd
}

/// Build a `tokio::process::Command` that runs `script` through the platform shell.
///
/// The child is killed when the command's future or handle is dropped, so
/// wrapping the wait in a deadline actually stops the process.
#[cfg(feature = "tokio")]
pub fn shell_command(script: impl AsRef<OsStr>) -> tokio::process::Command {
    let (program, flag) = SHELL;
    let mut cmd = tokio::process::Command::new(program);
    cmd.arg(flag).arg(script).kill_on_drop(true);
    cmd.no_window();
    cmd
}

/// Lossily decode captured output, trimming one trailing newline.
pub fn decode_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    text.strip_suffix('\r').unwrap_or(text).to_string()
}
