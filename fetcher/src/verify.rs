// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Blob verification.
//!
//! A blob is streamed into a temp file while its digest accumulates; only a
//! stream matching the expected digest is handed onward. The returned
//! reader serves from the start of the temp file and unlinks it on drop,
//! whether or not it was drained.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use vmm_sys_util::tempfile::TempFile;

use layercake_utils::digest::{DigestHasher, LayerDigest};

use crate::{FetchError, FetchResult};

#[derive(Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Verifier
    }

    /// Buffer `r` to a temp file, checking it against `digest`.
    pub fn verify(&self, r: &mut dyn Read, digest: &LayerDigest) -> FetchResult<VerifiedBlob> {
        let tmp = TempFile::new()
            .map_err(|e| FetchError::Io(std::io::Error::from_raw_os_error(e.errno())))?;
        let mut file = tmp.as_file().try_clone().map_err(FetchError::Io)?;

        let mut hasher = DigestHasher::new();
        let mut buf = [0u8; 32 * 1024];
        let mut size: i64 = 0;
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).map_err(FetchError::Io)?;
            size += n as i64;
        }

        let actual = hasher.finalize();
        if actual != *digest {
            return Err(FetchError::DigestMismatch {
                expected: digest.hex(),
                actual: actual.hex(),
            });
        }

        file.seek(SeekFrom::Start(0)).map_err(FetchError::Io)?;
        Ok(VerifiedBlob {
            file,
            _guard: tmp,
            size,
        })
    }
}

/// A digest-checked blob, readable from the beginning. Dropping it removes
/// the backing temp file.
#[derive(Debug)]
pub struct VerifiedBlob {
    file: File,
    _guard: TempFile,
    size: i64,
}

impl VerifiedBlob {
    pub fn size(&self) -> i64 {
        self.size
    }

    #[cfg(test)]
    fn path(&self) -> std::path::PathBuf {
        self._guard.as_path().to_path_buf()
    }
}

impl Read for VerifiedBlob {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}
