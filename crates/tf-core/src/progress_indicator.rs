//! `HH:MM:SS [n/total] message` progress lines for serial runs.
//!
//! On a terminal the current line is cleared and rewritten in place. On
//! anything else each update is a plain line with no control characters.

use chrono::Local;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, IsTerminal, Write};

pub struct ProgressIndicator<W: Write> {
    out: W,
    tty: bool,
    total: u32,
    /// A rewritable line is currently on screen.
    pending: bool,
}

impl ProgressIndicator<Box<dyn Write + Send>> {
    /// Indicator on stderr, rewriting in place when stderr is a terminal.
    pub fn stderr(total: u32) -> Self {
        let err = io::stderr();
        let tty = err.is_terminal();
        Self::new(Box::new(err), tty, total)
    }
}

impl<W: Write> ProgressIndicator<W> {
    pub fn new(out: W, tty: bool, total: u32) -> Self {
        Self {
            out,
            tty,
            total,
            pending: false,
        }
    }

    /// Shows progress for item `current`.
    pub fn update(&mut self, current: u32, message: &str) -> io::Result<()> {
        let line = self.format_line(current, message);
        if self.tty {
            self.clear_line()?;
            write!(self.out, "{line}")?;
            self.pending = true;
        } else {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()
    }

    /// Prints a final line and leaves it on screen.
    pub fn finish(&mut self, current: u32, message: &str) -> io::Result<()> {
        let line = self.format_line(current, message);
        if self.tty {
            self.clear_line()?;
        }
        writeln!(self.out, "{line}")?;
        self.pending = false;
        self.out.flush()
    }

    fn clear_line(&mut self) -> io::Result<()> {
        if self.pending {
            queue!(self.out, Clear(ClearType::CurrentLine))?;
            write!(self.out, "\r")?;
        }
        Ok(())
    }

    fn format_line(&self, current: u32, message: &str) -> String {
        format!(
            "{} [{}/{}] {}",
            Local::now().format("%H:%M:%S"),
            current,
            self.total,
            message
        )
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
