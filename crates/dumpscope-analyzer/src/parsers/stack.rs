//! Thread list and managed stack rows

use dumpscope_core::{AnalyzerStackFrame, ThreadDetails};

use super::cursor::{parse_dec, parse_hex, Cursor};

/// One row of the thread listing.
///
/// `dotnet-dump` prints `*0 0x1A2B (6699)` with `*` on the current thread.
/// `!threads` under WinDbg prints a wide table starting with the debugger
/// index, managed id and OS id; no current marker is parsed from it.
pub fn parse_thread(line: &str) -> Option<ThreadDetails> {
    let trimmed = line.trim_start();
    let (is_current, rest) = match trimmed.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut cursor = Cursor::new(rest);
    let index = u32::try_from(cursor.dec_u64()?).ok()?;
    let os_token = cursor.token()?;

    if os_token.starts_with("0x") || os_token.starts_with("0X") {
        let os_thread_id = u32::try_from(parse_hex(os_token)?).ok()?;
        if let Some(echo) = cursor.token() {
            let decimal = echo.strip_prefix('(')?.strip_suffix(')')?;
            parse_dec(decimal)?;
        }
        return Some(ThreadDetails {
            index,
            os_thread_id,
            is_current,
        });
    }

    // WinDbg: DBG ID, managed ID, OSID, ThreadOBJ, state ...
    parse_dec(os_token)?;
    let os_thread_id = u32::try_from(cursor.hex_u64()?).ok()?;
    cursor.hex_u64()?;
    Some(ThreadDetails {
        index,
        os_thread_id,
        is_current,
    })
}

/// `childSP instructionPointer callSite`
pub fn parse_stack_frame(line: &str) -> Option<AnalyzerStackFrame> {
    let mut cursor = Cursor::new(line);
    let stack_pointer = cursor.hex_u64()?;
    let instruction_pointer = cursor.hex_u64()?;
    let call_site = cursor.remainder()?;
    Some(AnalyzerStackFrame {
        stack_pointer,
        instruction_pointer,
        call_site: call_site.to_string(),
    })
}
