//! Tunables of the simulated machine and the kernel.
//!
//! Configuration files are lines of `key = value`. `#` starts a comment and
//! blank lines are ignored.

use core::error::Error;
use core::fmt::{self, Display, Formatter};
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, space0};
use nom::combinator::{all_consuming, rest};
use nom::sequence::{delimited, separated_pair};
use nom::IResult;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use swapos_shared::mem::{
    DEFAULT_NUM_PHYS_PAGES, DEFAULT_PAGE_SIZE, DEFAULT_STACK_PAGES, DEFAULT_SWAP_SLOTS,
    DEFAULT_TLB_SIZE, MAX_PAGE_NUMBER,
};

/// Which [`PageReplacementPolicy`](crate::mem::PageReplacementPolicy) evicts
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementKind {
    #[default]
    Clock,
    Random,
}

impl FromStr for ReplacementKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clock" => Ok(ReplacementKind::Clock),
            "random" => Ok(ReplacementKind::Random),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub num_phys_pages: usize,
    pub tlb_size: usize,
    pub page_size: usize,
    pub swap_slots: usize,
    /// Host file backing the swap extent. `None` keeps swap in memory.
    pub swap_path: Option<PathBuf>,
    /// Zero-filled pages appended to every address space.
    pub stack_pages: usize,
    pub replacement: ReplacementKind,
    pub random_seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: DEFAULT_NUM_PHYS_PAGES,
            tlb_size: DEFAULT_TLB_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            swap_slots: DEFAULT_SWAP_SLOTS,
            swap_path: None,
            stack_pages: DEFAULT_STACK_PAGES,
            replacement: ReplacementKind::Clock,
            random_seed: 0,
        }
    }
}

pub enum ConfigError {
    Io(io::Error),
    /// A line that is not `key = value`
    Syntax { line: usize },
    UnknownKey { line: usize, key: String },
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    /// The values parse but describe an impossible machine
    Invalid(&'static str),
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "could not read configuration: {err}"),
            ConfigError::Syntax { line } => write!(f, "line {line}: expected `key = value`"),
            ConfigError::UnknownKey { line, key } => write!(f, "line {line}: unknown key `{key}`"),
            ConfigError::InvalidValue { line, key, value } => {
                write!(f, "line {line}: `{value}` is not a valid value for `{key}`")
            }
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

fn key_value(line: &str) -> IResult<&str, (&str, &str)> {
    all_consuming(separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_'),
        delimited(space0, char('='), space0),
        rest,
    ))(line)
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

impl KernelConfig {
    /// Parses a configuration file's contents on top of the defaults. The
    /// result is validated.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let (_, (key, value)) = key_value(content).map_err(|_| ConfigError::Syntax { line })?;
            let value = value.trim_end();
            match key {
                "machine.frames" => config.num_phys_pages = parse_value(line, key, value)?,
                "machine.tlb_size" => config.tlb_size = parse_value(line, key, value)?,
                "machine.page_size" => config.page_size = parse_value(line, key, value)?,
                "swap.slots" => config.swap_slots = parse_value(line, key, value)?,
                "swap.path" if value.is_empty() => {
                    return Err(ConfigError::InvalidValue {
                        line,
                        key: key.to_owned(),
                        value: value.to_owned(),
                    })
                }
                "swap.path" => config.swap_path = Some(PathBuf::from(value)),
                "process.stack_pages" => config.stack_pages = parse_value(line, key, value)?,
                "vm.replacement" => config.replacement = parse_value(line, key, value)?,
                "vm.seed" => config.random_seed = parse_value(line, key, value)?,
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_owned(),
                    })
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_phys_pages == 0 {
            return Err(ConfigError::Invalid("the machine needs at least one frame"));
        }
        if self.num_phys_pages - 1 > MAX_PAGE_NUMBER {
            return Err(ConfigError::Invalid("too many frames for a translation entry"));
        }
        if self.tlb_size == 0 {
            return Err(ConfigError::Invalid("the translation cache needs at least one slot"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("the page size must be a power of two"));
        }
        if self.swap_slots == 0 {
            return Err(ConfigError::Invalid("swap needs at least one slot"));
        }
        if self.swap_slots.checked_mul(self.page_size).is_none()
            || self.num_phys_pages.checked_mul(self.page_size).is_none()
        {
            return Err(ConfigError::Invalid("memory sizes overflow"));
        }
        Ok(())
    }

    /// Size of the swap extent in bytes.
    pub fn swap_len(&self) -> usize {
        self.swap_slots * self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_gives_defaults() {
        let config = KernelConfig::parse("\n# nothing here\n   \n").expect("valid");
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.swap_len(), DEFAULT_SWAP_SLOTS * DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_every_key() {
        let text = "
            machine.frames = 2
            machine.tlb_size=1
            machine.page_size = 128   # small pages
            swap.slots = 3
            swap.path = /tmp/swapos test.swap
            process.stack_pages = 0
            vm.replacement = random
            vm.seed = 99
        ";
        let config = KernelConfig::parse(text).expect("valid");
        assert_eq!(config.num_phys_pages, 2);
        assert_eq!(config.tlb_size, 1);
        assert_eq!(config.page_size, 128);
        assert_eq!(config.swap_slots, 3);
        assert_eq!(config.swap_path, Some(PathBuf::from("/tmp/swapos test.swap")));
        assert_eq!(config.stack_pages, 0);
        assert_eq!(config.replacement, ReplacementKind::Random);
        assert_eq!(config.random_seed, 99);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        assert!(matches!(
            KernelConfig::parse("machine.frames = 2\nnonsense"),
            Err(ConfigError::Syntax { line: 2 })
        ));
        assert!(matches!(
            KernelConfig::parse("machine.colour = blue"),
            Err(ConfigError::UnknownKey { line: 1, .. })
        ));
        assert!(matches!(
            KernelConfig::parse("\nvm.replacement = lru"),
            Err(ConfigError::InvalidValue { line: 2, .. })
        ));
        assert!(matches!(
            KernelConfig::parse("machine.frames = -1"),
            Err(ConfigError::InvalidValue { line: 1, .. })
        ));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            KernelConfig::parse("machine.page_size = 100"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            KernelConfig::parse("machine.frames = 0"),
            Err(ConfigError::Invalid(_))
        ));
        let config = KernelConfig {
            num_phys_pages: MAX_PAGE_NUMBER + 2,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = KernelConfig::load("/nonexistent/swapos.conf").expect_err("no such file");
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.source().is_some());
    }
}
