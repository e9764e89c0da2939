//! Spawn-time tweaks for the game process and short-lived java helpers.

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Detach a command from the launcher before spawning so the game keeps
/// running when the launcher closes: its own session on unix, a fresh
/// process group (and no console window) on Windows.
pub fn detach(command: &mut tokio::process::Command) {
    #[cfg(windows)]
    {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

/// Stop a helper invocation (installer processors) from flashing a console
/// window. No effect outside Windows.
pub fn suppress_console(command: &mut tokio::process::Command) {
    #[cfg(windows)]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    {
        let _ = command;
    }
}

/// Same, for the synchronous `taskkill` fallback in the stop path.
#[cfg(windows)]
pub fn suppress_console_std(command: &mut std::process::Command) {
    use std::os::windows::process::CommandExt as _;
    command.creation_flags(CREATE_NO_WINDOW);
}
