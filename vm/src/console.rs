//! Host terminal input for the guest UART.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Ctrl-A, the escape prefix.
pub const ESCAPE: u8 = 0x01;
const QUIT_KEY: u8 = b'x';

/// What a host keystroke means after escape processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Deliver this byte to the guest.
    Forward(u8),
    /// The user asked to end the run.
    Quit,
    /// Swallowed (a pending escape prefix).
    Pending,
}

/// Ctrl-A prefix handling: `Ctrl-A x` quits, `Ctrl-A Ctrl-A` sends a literal
/// Ctrl-A, and `Ctrl-A <other>` sends `<other>`.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    escaped: bool,
}

impl EscapeFilter {
    pub fn feed(&mut self, byte: u8) -> KeyAction {
        if !self.escaped {
            if byte == ESCAPE {
                self.escaped = true;
                return KeyAction::Pending;
            }
            return KeyAction::Forward(byte);
        }
        self.escaped = false;
        match byte {
            QUIT_KEY => KeyAction::Quit,
            other => KeyAction::Forward(other),
        }
    }
}

/// Stdin reader running on a background thread.
///
/// When stdin is a TTY it is switched to non-canonical, no-echo input for
/// the lifetime of the value. Output processing is left alone so the guest's
/// `\n` still returns the cursor.
pub struct Console {
    rx: mpsc::Receiver<u8>,
    original_termios: Option<libc::termios>,
    running: Arc<AtomicBool>,
    filter: EscapeFilter,
}

impl Console {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let r_clone = running.clone();

        let original_termios = enter_raw_input();

        thread::spawn(move || {
            let mut buf = [0u8; 1];
            let stdin = io::stdin();
            let mut handle = stdin.lock();

            while r_clone.load(Ordering::Relaxed) {
                match handle.read(&mut buf) {
                    Ok(0) => thread::sleep(std::time::Duration::from_millis(10)),
                    Ok(_) => {
                        if tx.send(buf[0]).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("console reader stopped: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            original_termios,
            running,
            filter: EscapeFilter::default(),
        }
    }

    pub fn is_tty(&self) -> bool {
        self.original_termios.is_some()
    }

    /// Next keystroke, if one is waiting. Never blocks.
    pub fn poll(&mut self) -> Option<KeyAction> {
        let byte = self.rx.try_recv().ok()?;
        Some(self.filter.feed(byte))
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the previous settings when stdin is a terminal.
fn enter_raw_input() -> Option<libc::termios> {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        return None;
    }
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut termios) } != 0 {
        return None;
    }
    let mut raw = termios;
    raw.c_iflag &= !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
    raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
    raw.c_cflag |= libc::CS8;
    // OPOST stays set, unlike cfmakeraw()
    raw.c_cc[libc::VMIN] = 1;
    raw.c_cc[libc::VTIME] = 0;
    unsafe {
        libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw);
    }
    Some(termios)
}

impl Drop for Console {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(termios) = self.original_termios {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios);
            }
        }
    }
}
