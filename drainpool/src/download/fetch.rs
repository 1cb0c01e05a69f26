// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{bail, Context};

/// Reads are done in chunks of this size.
pub const BUF_SIZE: usize = 4096;

/// Opens the byte stream behind a URL.
///
/// Network transports live outside this crate; anything that can hand out a
/// reader for a URL plugs in here.
pub trait Fetch: Send + Sync + 'static {
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn Read + Send>>;
}

impl<F> Fetch for F
where
    F: Fn(&str) -> anyhow::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
{
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn Read + Send>> {
        self(url)
    }
}

/// Serves `file://` URLs and plain paths from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileFetcher;

impl Fetch for FileFetcher {
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn Read + Send>> {
        let path = match url.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, _)) => bail!("unsupported scheme {scheme} in {url}"),
            None => url,
        };
        let file = File::open(Path::new(path)).with_context(|| format!("cannot open {path}"))?;
        Ok(Box::new(file))
    }
}

/// Copies `src` into `dst` one [`BUF_SIZE`] chunk at a time.
pub fn copy_chunked(src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<u64> {
    let mut buf = [0u8; BUF_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n])?;
        copied += n as u64;
    }
}

/// Reads everything behind `url` into memory.
pub fn fetch_bytes(fetcher: &dyn Fetch, url: &str) -> anyhow::Result<Vec<u8>> {
    let mut source = fetcher.open(url)?;
    let mut bytes = Vec::new();
    copy_chunked(&mut source, &mut bytes).with_context(|| format!("reading {url} failed"))?;
    Ok(bytes)
}
