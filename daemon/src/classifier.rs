/// Best-effort classification of an inspected process.
///
/// - service: the process runs in session 0, the non-interactive session that
///   hosts Windows services.
/// - GUI: the process is not a service, runs in a known session, and its image
///   is a PE file linked for the Windows GUI subsystem.
///
/// Anything that cannot be determined counts as `false`; classification never fails.
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::inspector::ProcessHandle;

const SERVICES_SESSION_ID: u32 = 0;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const DOS_HEADER_LEN: usize = 64;
/// Offset of `e_lfanew` inside the DOS header.
const E_LFANEW_OFFSET: usize = 0x3C;
const COFF_HEADER_LEN: usize = 20;
/// `Subsystem` sits at the same offset in PE32 and PE32+ optional headers.
const SUBSYSTEM_OFFSET: usize = 68;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
/// Sanity bound on `e_lfanew`; real images keep the PE header near the start.
const MAX_PE_HEADER_OFFSET: u32 = 0x10000;

/// PE optional-header subsystem values this daemon cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Native,
    WindowsGui,
    WindowsConsole,
    Other(u16),
}

impl From<u16> for Subsystem {
    fn from(value: u16) -> Self {
        match value {
            1 => Subsystem::Native,
            2 => Subsystem::WindowsGui,
            3 => Subsystem::WindowsConsole,
            other => Subsystem::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub is_gui: bool,
    pub is_service: bool,
}

/// Classifies the process behind `handle`, whose image lives at `image`.
pub fn classify<H: ProcessHandle>(handle: &H, image: &Path) -> Classification {
    let session = handle.session_id();
    let is_service = session == Some(SERVICES_SESSION_ID);
    let is_gui = !is_service
        && session.is_some()
        && matches!(read_subsystem(image), Ok(Subsystem::WindowsGui));
    Classification { is_gui, is_service }
}

/// Reads the subsystem field from the PE header of the file at `path`.
pub fn read_subsystem(path: &Path) -> io::Result<Subsystem> {
    let mut file = File::open(path)?;
    read_subsystem_from(&mut file)
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_subsystem_from<R: Read + Seek>(reader: &mut R) -> io::Result<Subsystem> {
    let mut dos = [0u8; DOS_HEADER_LEN];
    reader.read_exact(&mut dos)?;
    if &dos[..2] != DOS_MAGIC {
        return Err(invalid("missing MZ signature"));
    }
    let mut lfanew = [0u8; 4];
    lfanew.copy_from_slice(&dos[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4]);
    let pe_offset = u32::from_le_bytes(lfanew);
    if pe_offset > MAX_PE_HEADER_OFFSET {
        return Err(invalid("PE header offset out of range"));
    }

    let mut header = [0u8; 4 + COFF_HEADER_LEN + SUBSYSTEM_OFFSET + 2];
    reader.seek(SeekFrom::Start(u64::from(pe_offset)))?;
    reader.read_exact(&mut header)?;
    if &header[..4] != PE_SIGNATURE {
        return Err(invalid("missing PE signature"));
    }

    let optional = &header[4 + COFF_HEADER_LEN..];
    let magic = u16::from_le_bytes([optional[0], optional[1]]);
    if magic != PE32_MAGIC && magic != PE32_PLUS_MAGIC {
        return Err(invalid("unknown optional header magic"));
    }
    let subsystem = u16::from_le_bytes([optional[SUBSYSTEM_OFFSET], optional[SUBSYSTEM_OFFSET + 1]]);
    Ok(Subsystem::from(subsystem))
}
