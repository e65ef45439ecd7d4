//! SPIR-V shader binaries.

use std::io::Read;
use std::path::Path;

use crate::error::{Result, VulkanError};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Five-word module header.
const HEADER_WORDS: usize = 5;

/// A SPIR-V module whose header has been checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderCode {
    words: Vec<u32>,
}

impl ShaderCode {
    pub fn from_words(words: Vec<u32>) -> Result<Self> {
        if words.len() < HEADER_WORDS {
            return Err(VulkanError::InvalidShader(format!(
                "{} words is shorter than the {}-word header",
                words.len(),
                HEADER_WORDS
            )));
        }
        if words[0] != SPIRV_MAGIC {
            return Err(VulkanError::InvalidShader(format!(
                "bad magic number {:#010x}",
                words[0]
            )));
        }
        Ok(Self { words })
    }

    /// Decode a little-endian byte stream.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(VulkanError::InvalidShader(format!(
                "length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_words(words)
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// `(major, minor)` from the header version word.
    pub fn version(&self) -> (u32, u32) {
        let v = self.words[1];
        ((v >> 16) & 0xFF, (v >> 8) & 0xFF)
    }
}

impl TryFrom<&[u8]> for ShaderCode {
    type Error = VulkanError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }
}

impl TryFrom<Vec<u32>> for ShaderCode {
    type Error = VulkanError;

    fn try_from(words: Vec<u32>) -> Result<Self> {
        Self::from_words(words)
    }
}

/// Smallest valid compute module: `void main() {}` with local size 1x1x1.
#[cfg(test)]
pub(crate) const EMPTY_KERNEL: &[u32] = &[
    SPIRV_MAGIC, 0x0001_0000, 0, 5, 0,
    0x0002_0011, 1,                          // OpCapability Shader
    0x0003_000E, 0, 1,                       // OpMemoryModel Logical GLSL450
    0x0005_000F, 5, 1, 0x6E69_616D, 0,       // OpEntryPoint GLCompute %1 "main"
    0x0006_0010, 1, 17, 1, 1, 1,             // OpExecutionMode %1 LocalSize 1 1 1
    0x0002_0013, 2,                          // %2 = OpTypeVoid
    0x0003_0021, 3, 2,                       // %3 = OpTypeFunction %2
    0x0005_0036, 2, 1, 0, 3,                 // %1 = OpFunction %2 None %3
    0x0002_00F8, 4,                          // OpLabel
    0x0001_00FD,                             // OpReturn
    0x0001_0038,                             // OpFunctionEnd
];
