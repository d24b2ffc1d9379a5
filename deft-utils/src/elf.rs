use std::borrow::Cow;

/// Relocation numbers the `object` crate either lacks or carries under their
/// pre-EABI names.
pub const R_ARM_THM_CALL: u32 = object::elf::R_ARM_THM_PC22;
pub const R_ARM_THM_JUMP11: u32 = object::elf::R_ARM_THM_PC11;
pub const R_ARM_GOT_BREL: u32 = object::elf::R_ARM_GOT32;
pub const R_ARM_BASE_PREL: u32 = object::elf::R_ARM_GOTPC;
pub const R_PPC64_PLTSEQ: u32 = 119;
pub const R_PPC64_PLTCALL: u32 = 120;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

pub fn arm32_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    let renamed = match r_type {
        R_ARM_THM_CALL => Some("R_ARM_THM_CALL"),
        R_ARM_THM_JUMP11 => Some("R_ARM_THM_JUMP11"),
        R_ARM_GOT_BREL => Some("R_ARM_GOT_BREL"),
        R_ARM_BASE_PREL => Some("R_ARM_BASE_PREL"),
        _ => None,
    };
    if let Some(name) = renamed.or_else(|| {
        const_name_by_value![
            r_type,
            R_ARM_NONE,
            R_ARM_ABS32,
            R_ARM_REL32,
            R_ARM_CALL,
            R_ARM_JUMP24,
            R_ARM_THM_JUMP24,
            R_ARM_THM_JUMP19,
            R_ARM_TARGET1,
            R_ARM_TARGET2,
            R_ARM_GOT_PREL,
            R_ARM_PREL31,
            R_ARM_MOVW_ABS_NC,
            R_ARM_MOVT_ABS,
            R_ARM_MOVW_PREL_NC,
            R_ARM_MOVT_PREL,
            R_ARM_THM_MOVW_ABS_NC,
            R_ARM_THM_MOVT_ABS,
            R_ARM_THM_MOVW_PREL_NC,
            R_ARM_THM_MOVT_PREL,
            R_ARM_TLS_GD32,
            R_ARM_TLS_LDM32,
            R_ARM_TLS_LDO32,
            R_ARM_TLS_IE32,
            R_ARM_TLS_LE32,
            R_ARM_TLS_GOTDESC,
            R_ARM_TLS_CALL,
            R_ARM_THM_TLS_CALL,
            R_ARM_V4BX,
            R_ARM_COPY,
            R_ARM_GLOB_DAT,
            R_ARM_JUMP_SLOT,
            R_ARM_RELATIVE,
            R_ARM_IRELATIVE,
            R_ARM_TLS_DTPMOD32,
            R_ARM_TLS_DTPOFF32,
            R_ARM_TLS_TPOFF32,
            R_ARM_TLS_DESC
        ]
    }) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

pub fn ppc64_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    let renamed = match r_type {
        R_PPC64_PLTSEQ => Some("R_PPC64_PLTSEQ"),
        R_PPC64_PLTCALL => Some("R_PPC64_PLTCALL"),
        _ => None,
    };
    if let Some(name) = renamed.or_else(|| {
        const_name_by_value![
            r_type,
            R_PPC64_NONE,
            R_PPC64_ADDR64,
            R_PPC64_ADDR32,
            R_PPC64_REL24,
            R_PPC64_REL32,
            R_PPC64_REL64,
            R_PPC64_TOC16_HA,
            R_PPC64_TOC16_LO,
            R_PPC64_TOC16_DS,
            R_PPC64_TOC16_LO_DS,
            R_PPC64_REL16_HA,
            R_PPC64_REL16_LO,
            R_PPC64_PLT16_HA,
            R_PPC64_PLT16_HI,
            R_PPC64_PLT16_LO,
            R_PPC64_PLT16_LO_DS,
            R_PPC64_GOT_TPREL16_HA,
            R_PPC64_GOT_TPREL16_LO_DS,
            R_PPC64_GOT_TLSGD16_HA,
            R_PPC64_GOT_TLSGD16_LO,
            R_PPC64_GOT_TLSLD16_HA,
            R_PPC64_GOT_TLSLD16_LO,
            R_PPC64_DTPREL16_HA,
            R_PPC64_DTPREL16_LO,
            R_PPC64_DTPREL64,
            R_PPC64_TPREL16_HA,
            R_PPC64_TPREL16_LO,
            R_PPC64_TLS,
            R_PPC64_TLSGD,
            R_PPC64_TLSLD,
            R_PPC64_COPY,
            R_PPC64_GLOB_DAT,
            R_PPC64_JMP_SLOT,
            R_PPC64_RELATIVE,
            R_PPC64_IRELATIVE,
            R_PPC64_DTPMOD64,
            R_PPC64_TPREL64
        ]
    }) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

/// Section flag bit values.
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_WRITE as u64);
    pub const ALLOC: SectionFlags = SectionFlags::from_u64(object::elf::SHF_ALLOC as u64);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);
    pub const MERGE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_MERGE as u64);
    pub const STRINGS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_STRINGS as u64);
    pub const TLS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_TLS as u64);
}

/// A section's `sh_flags` value. Wide enough for both the 32-bit and the
/// 64-bit ELF variants.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u64);

impl SectionFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_u64(raw: u64) -> SectionFlags {
        SectionFlags(raw)
    }

    pub fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for SectionFlags {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(shf::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(shf::ALLOC) {
            f.write_str("A")?;
        }
        if self.contains(shf::EXECINSTR) {
            f.write_str("X")?;
        }
        if self.contains(shf::MERGE) {
            f.write_str("M")?;
        }
        if self.contains(shf::STRINGS) {
            f.write_str("S")?;
        }
        if self.contains(shf::TLS) {
            f.write_str("T")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_type_to_string() {
        assert_eq!(
            &arm32_rel_type_to_string(object::elf::R_ARM_ABS32),
            "R_ARM_ABS32"
        );
        assert_eq!(&arm32_rel_type_to_string(R_ARM_THM_CALL), "R_ARM_THM_CALL");
        assert_eq!(&arm32_rel_type_to_string(0xfff), "Unknown relocation type 0xfff");
        assert_eq!(
            &ppc64_rel_type_to_string(object::elf::R_PPC64_REL24),
            "R_PPC64_REL24"
        );
        assert_eq!(&ppc64_rel_type_to_string(R_PPC64_PLTCALL), "R_PPC64_PLTCALL");
    }

    #[test]
    fn test_section_flags_display() {
        let flags = SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR);
        assert_eq!(format!("{flags}"), "AX");
        assert!(flags.contains(shf::ALLOC));
        assert!(!flags.contains(shf::WRITE));
    }
}
