use crate::{
    meter,
    provider::{Downloader, ProviderError, Uploader},
};
use flate2::{read::ZlibDecoder, write::ZlibEncoder};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

#[derive(Debug, thiserror::Error)]
#[error("unsupported compression algorithm: '{0}'")]
pub struct BadCompression(pub String);

/// The compression algorithms a bucket can be configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

impl Compression {
    pub fn is_none(self) -> bool {
        self == Compression::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = BadCompression;

    fn from_str(s: &str) -> Result<Compression, BadCompression> {
        match s {
            "none" | "" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => Err(BadCompression(other.to_owned())),
        }
    }
}

impl Serialize for Compression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Wraps `up` so that bytes are compressed before they reach the layer
/// below. For `none` the uploader passes through untouched.
pub fn compress(up: Box<dyn Uploader>, alg: Compression) -> Box<dyn Uploader> {
    match alg {
        Compression::None => up,
        Compression::Zlib => Box::new(ZlibUploader {
            w: ZlibEncoder::new(up, flate2::Compression::default()),
            meter: meter::Meter::new(),
            finished: false,
        }),
    }
}

/// Wraps `down` so that bytes read are decompressed. For `none` the
/// downloader passes through untouched.
pub fn decompress(down: Box<dyn Downloader>, alg: Compression) -> Box<dyn Downloader> {
    match alg {
        Compression::None => down,
        Compression::Zlib => Box::new(ZlibDownloader {
            r: ZlibDecoder::new(down),
            meter: meter::Meter::new(),
        }),
    }
}

struct ZlibUploader {
    w: ZlibEncoder<Box<dyn Uploader>>,
    // Plaintext bytes accepted at this layer.
    meter: meter::Meter,
    finished: bool,
}

impl Write for ZlibUploader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.w.write(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl Uploader for ZlibUploader {
    fn path(&self) -> String {
        self.w.get_ref().path()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        // The zlib trailer has to land in the layer below before that layer
        // finalizes the blob.
        if !self.finished {
            self.w.try_finish()?;
            self.finished = true;
        }
        self.w.get_mut().close()
    }

    fn cancel(&mut self) -> Result<(), ProviderError> {
        self.finished = true;
        self.w.get_mut().cancel()
    }

    fn wrote_uncompressed(&self) -> u64 {
        self.meter.total()
    }

    fn wrote_compressed(&self) -> u64 {
        self.w.get_ref().wrote_compressed()
    }
}

struct ZlibDownloader {
    r: ZlibDecoder<Box<dyn Downloader>>,
    // Inflated bytes handed to the layer above.
    meter: meter::Meter,
}

impl Read for ZlibDownloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.r.read(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }
}

impl Downloader for ZlibDownloader {
    fn close(&mut self) -> Result<(), ProviderError> {
        self.r.get_mut().close()
    }

    fn read_uncompressed(&self) -> u64 {
        self.meter.total()
    }

    fn read_compressed(&self) -> u64 {
        self.r.get_ref().read_compressed()
    }
}
