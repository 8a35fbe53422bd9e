use std::io::{self, Read};

use crate::error::Error;
use crate::hash::{Hasher, Ref};

/// wraps a reader and checks the content hash once the stream is drained
///
/// the check fires exactly once, at the first read that observes EOF; a
/// mismatch surfaces as an io error carrying [`Error::RefMismatch`].
pub struct VerifyReader<R> {
    inner: R,
    expect: Ref,
    h: Option<Hasher>,
}

impl<R: Read> VerifyReader<R> {
    pub fn new(inner: R, expect: Ref) -> VerifyReader<R> {
        VerifyReader {
            inner,
            expect,
            h: Some(Hasher::new()),
        }
    }

    fn verify(&mut self) -> io::Result<()> {
        let h = match self.h.take() {
            Some(h) => h,
            None => return Ok(()),
        };
        let got = h.finalize();
        if got != self.expect {
            return Err(Error::RefMismatch {
                expected: self.expect,
                got,
            }
            .into_io());
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyReader<R> {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(p)?;
        if n != 0 {
            if let Some(h) = &mut self.h {
                h.update(&p[..n]);
            }
        } else {
            self.verify()?;
        }
        Ok(n)
    }
}
