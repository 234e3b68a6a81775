//! Debugger command lines and the per-debugger command vocabulary
//!
//! A [`Command`] is composed into a fixed stack buffer and written to the
//! backend together with the transport's newline, so issuing the thousands of
//! `dumpobj`/`dd` lines a heap walk needs allocates nothing per command.

use std::fmt::{self, Write as _};
use std::io::{self, Write};

use dumpscope_core::prelude::*;
use dumpscope_core::HeapScope;

use crate::text::{Encoding, Newline};

/// Longest command line, excluding the newline
pub const COMMAND_CAPACITY: usize = 256;

/// One command line, immutable once built
#[derive(Clone, Copy)]
pub struct Command {
    buf: [u8; COMMAND_CAPACITY],
    len: usize,
}

/// `fmt::Write` over the command's stack buffer
struct StackWriter<'a> {
    buf: &'a mut [u8; COMMAND_CAPACITY],
    len: &'a mut usize,
}

impl fmt::Write for StackWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = *self.len + s.len();
        if end > COMMAND_CAPACITY {
            return Err(fmt::Error);
        }
        self.buf[*self.len..end].copy_from_slice(s.as_bytes());
        *self.len = end;
        Ok(())
    }
}

impl Command {
    fn compose(args: fmt::Arguments<'_>) -> Result<Self> {
        let mut buf = [0u8; COMMAND_CAPACITY];
        let mut len = 0;
        let mut writer = StackWriter {
            buf: &mut buf,
            len: &mut len,
        };
        writer.write_fmt(args).map_err(|_| Error::CommandTooLong {
            command: truncate_for_error(&args.to_string()),
            limit: COMMAND_CAPACITY,
        })?;
        Ok(Self { buf, len })
    }

    /// Command consisting of `prefix` alone
    pub fn new(prefix: &str) -> Result<Self> {
        Self::compose(format_args!("{}", prefix))
    }

    /// `prefix ADDRESS`, address in uppercase hex without `0x`
    pub fn with_address(prefix: &str, address: u64) -> Result<Self> {
        Self::compose(format_args!("{} {:X}", prefix, address))
    }

    /// `prefix COUNT`, count in decimal
    pub fn with_count(prefix: &str, count: u64) -> Result<Self> {
        Self::compose(format_args!("{} {}", prefix, count))
    }

    /// `prefix COUNT infix ADDRESS`
    pub fn with_count_and_address(
        prefix: &str,
        count: u64,
        infix: &str,
        address: u64,
    ) -> Result<Self> {
        Self::compose(format_args!("{} {} {} {:X}", prefix, count, infix, address))
    }

    /// Caller-supplied command text, passed through verbatim
    pub fn raw(text: &str) -> Result<Self> {
        if text.contains(['\r', '\n']) {
            return Err(Error::protocol(format!(
                "command must be a single line: {:?}",
                text
            )));
        }
        Self::new(text)
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from `&str` fragments.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write the command line followed by `newline`
    pub fn write_to<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        encoding: Encoding,
        newline: Newline,
    ) -> io::Result<()> {
        let text = self.as_str();
        if encoding == Encoding::Utf8 || text.is_ascii() {
            writer.write_all(text.as_bytes())?;
        } else {
            let mut encoded = Vec::with_capacity(text.len());
            encoding.encode_into(text, &mut encoded);
            writer.write_all(&encoded)?;
        }
        writer.write_all(newline.as_bytes())?;
        writer.flush()
    }
}

fn truncate_for_error(text: &str) -> String {
    match text.char_indices().nth(64) {
        Some((at, _)) => format!("{}...", &text[..at]),
        None => text.to_string(),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Command").field(&self.as_str()).finish()
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Command {}

// ─────────────────────────────────────────────────────────────────────────────
// Vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// Offset of the length field inside a 64-bit `System.String`
pub const STRING_LENGTH_OFFSET: u64 = 8;
/// Offset of the first character inside a 64-bit `System.String`
pub const STRING_CHARS_OFFSET: u64 = 12;

/// Command dialect of a debugger backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `dotnet-dump analyze`: SOS commands are built in
    #[default]
    DotnetDump,
    /// WinDbg/cdb with SOS loaded as an extension
    WinDbg,
}

impl Dialect {
    fn sos(&self, name: &str) -> Result<Command> {
        match self {
            Dialect::DotnetDump => Command::new(name),
            Dialect::WinDbg => Command::compose(format_args!("!{}", name)),
        }
    }

    fn sos_with_address(&self, name: &str, address: u64) -> Result<Command> {
        match self {
            Dialect::DotnetDump => Command::with_address(name, address),
            Dialect::WinDbg => Command::compose(format_args!("!{} {:X}", name, address)),
        }
    }

    pub fn dump_heap(&self, scope: HeapScope) -> Result<Command> {
        match scope {
            HeapScope::Live => self.sos("dumpheap -live"),
            HeapScope::Dead => self.sos("dumpheap -dead"),
        }
    }

    pub fn dump_heap_stat(&self) -> Result<Command> {
        self.sos("dumpheap -stat")
    }

    pub fn threads(&self) -> Result<Command> {
        self.sos("threads")
    }

    /// Make the managed thread at `index` current for subsequent stack commands
    pub fn select_thread(&self, index: u32) -> Result<Command> {
        match self {
            Dialect::DotnetDump => Command::with_count("setthread", u64::from(index)),
            Dialect::WinDbg => Command::compose(format_args!("~{}s", index)),
        }
    }

    pub fn clr_stack(&self) -> Result<Command> {
        self.sos("clrstack")
    }

    /// Short form used for string objects
    pub fn dump_object_short(&self, address: u64) -> Result<Command> {
        self.sos_with_address("do", address)
    }

    pub fn dump_object(&self, address: u64) -> Result<Command> {
        self.sos_with_address("dumpobj", address)
    }

    /// One DWORD at `address`
    pub fn read_dword(&self, address: u64) -> Result<Command> {
        Command::with_address("dd -c 1", address)
    }

    /// `count` UTF-16 code units at `address` on a single output line.
    ///
    /// `-c` is the total number of units and `-w` the number per row.
    pub fn read_words(&self, address: u64, count: u64) -> Result<Command> {
        Command::compose(format_args!("dw -c {} -w {} {:X}", count, count, address))
    }

    /// `count` QWORDs at `address`, one per output line
    pub fn read_qwords(&self, address: u64, count: u64) -> Result<Command> {
        Command::with_count_and_address("dq -c", count, "-w 1", address)
    }

    pub fn dump_delegate(&self, address: u64) -> Result<Command> {
        self.sos_with_address("dumpdelegate", address)
    }

    pub fn dump_method_table(&self, method_table: u64) -> Result<Command> {
        self.sos_with_address("dumpmt", method_table)
    }

    pub fn dump_class(&self, ee_class: u64) -> Result<Command> {
        self.sos_with_address("dumpclass", ee_class)
    }

    pub fn dump_array(&self, address: u64) -> Result<Command> {
        self.sos_with_address("dumparray", address)
    }

    pub fn dump_async(&self) -> Result<Command> {
        self.sos("dumpasync -completed")
    }

    pub fn ee_heap_gc(&self) -> Result<Command> {
        self.sos("eeheap -gc")
    }

    pub fn gc_handles(&self) -> Result<Command> {
        self.sos("gchandles")
    }

    pub fn gc_heap_stat(&self) -> Result<Command> {
        self.sos("gcheapstat")
    }

    pub fn exit(&self) -> Result<Command> {
        match self {
            Dialect::DotnetDump => Command::new("exit"),
            Dialect::WinDbg => Command::new("q"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_uppercase_hex_without_prefix() {
        let cmd = Command::with_address("do", 0x2000).unwrap();
        assert_eq!(cmd.as_str(), "do 2000");

        let cmd = Command::with_address("dumpobj", 0x7ffe_12ab_cd00).unwrap();
        assert_eq!(cmd.to_string(), "dumpobj 7FFE12ABCD00");
    }

    #[test]
    fn test_prefix_only_is_unchanged() {
        assert_eq!(
            Command::new("dumpheap -live").unwrap().as_str(),
            "dumpheap -live"
        );
    }

    #[test]
    fn test_count_and_address() {
        let cmd = Command::with_count_and_address("dq -c", 5, "-w 1", 0x1F).unwrap();
        assert_eq!(cmd.as_str(), "dq -c 5 -w 1 1F");
        assert_eq!(Command::with_count("setthread", 3).unwrap().as_str(), "setthread 3");
    }

    #[test]
    fn test_too_long_is_rejected() {
        let long = "x".repeat(COMMAND_CAPACITY + 1);
        let err = Command::new(&long).unwrap_err();
        assert!(matches!(err, Error::CommandTooLong { limit, .. } if limit == COMMAND_CAPACITY));

        let exact = "y".repeat(COMMAND_CAPACITY);
        assert_eq!(Command::new(&exact).unwrap().len(), COMMAND_CAPACITY);
    }

    #[test]
    fn test_raw_rejects_embedded_newline() {
        assert!(Command::raw("dumpheap\nexit").is_err());
        assert_eq!(Command::raw("!gcroot 1234").unwrap().as_str(), "!gcroot 1234");
    }

    #[test]
    fn test_write_to_appends_newline() {
        let mut out = Vec::new();
        Command::new("threads")
            .unwrap()
            .write_to(&mut out, Encoding::Utf8, Newline::CRLF)
            .unwrap();
        assert_eq!(out, b"threads\r\n");
    }

    #[test]
    fn test_write_to_encodes_single_byte() {
        let mut out = Vec::new();
        Command::raw("echo é")
            .unwrap()
            .write_to(&mut out, Encoding::Latin1, Newline::LF)
            .unwrap();
        assert_eq!(out, b"echo \xE9\n");
    }

    #[test]
    fn test_dialects_render_vocabulary() {
        let dd = Dialect::DotnetDump;
        let wd = Dialect::WinDbg;

        assert_eq!(dd.dump_heap(HeapScope::Live).unwrap().as_str(), "dumpheap -live");
        assert_eq!(wd.dump_heap(HeapScope::Dead).unwrap().as_str(), "!dumpheap -dead");
        assert_eq!(dd.select_thread(4).unwrap().as_str(), "setthread 4");
        assert_eq!(wd.select_thread(4).unwrap().as_str(), "~4s");
        assert_eq!(wd.dump_method_table(0xABC).unwrap().as_str(), "!dumpmt ABC");
        assert_eq!(dd.read_dword(0x10).unwrap().as_str(), "dd -c 1 10");
        assert_eq!(wd.read_dword(0x10).unwrap().as_str(), "dd -c 1 10");
        assert_eq!(dd.read_qwords(0x20, 3).unwrap().as_str(), "dq -c 3 -w 1 20");
        assert_eq!(dd.read_words(0x100C, 5).unwrap().as_str(), "dw -c 5 -w 5 100C");
        assert_eq!(wd.read_words(0x100C, 5).unwrap().as_str(), "dw -c 5 -w 5 100C");
        assert_eq!(dd.dump_async().unwrap().as_str(), "dumpasync -completed");
        assert_eq!(dd.ee_heap_gc().unwrap().as_str(), "eeheap -gc");
        assert_eq!(dd.exit().unwrap().as_str(), "exit");
    }
}
