use parking_lot::Mutex;
use std::{
    io::{self, Read, Write},
    sync::Arc,
};

#[derive(Default)]
struct Counts {
    base: u64,
    total: u64,
}

/// A thread-safe byte counter with total and delta semantics. `Meter` is a
/// cheap cloneable handle, so a pipeline layer can keep counting while an
/// observer on another thread reads totals.
#[derive(Clone, Default)]
pub struct Meter {
    counts: Arc<Mutex<Counts>>,
}

impl Meter {
    pub fn new() -> Meter {
        Meter::default()
    }

    pub fn add(&self, n: u64) {
        self.counts.lock().total += n;
    }

    /// Monotonic total of all bytes seen.
    pub fn total(&self) -> u64 {
        self.counts.lock().total
    }

    /// Bytes seen since the last call to `delta`. Reading the delta consumes
    /// it.
    pub fn delta(&self) -> u64 {
        let mut c = self.counts.lock();
        let n = c.total - c.base;
        c.base = c.total;
        n
    }
}

/// Counts the bytes successfully read through an inner reader.
pub struct Reader<R> {
    inner: R,
    meter: Meter,
}

impl<R> Reader<R> {
    pub fn new(inner: R) -> Reader<R> {
        Reader {
            inner,
            meter: Meter::new(),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter.clone()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }
}

/// Counts the bytes successfully written through an inner writer.
pub struct Writer<W> {
    inner: W,
    meter: Meter,
}

impl<W> Writer<W> {
    pub fn new(inner: W) -> Writer<W> {
        Writer {
            inner,
            meter: Meter::new(),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter.clone()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.meter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A single-owner change tracker over an externally maintained monotonic
/// total. Streams use one per layer to turn pipeline totals into per-request
/// increments for the metrics counters.
#[derive(Default)]
pub struct Delta {
    base: u64,
    n: u64,
}

impl Delta {
    pub fn set(&mut self, to: u64) {
        self.n = to;
    }

    pub fn delta(&mut self) -> u64 {
        let n = self.n - self.base;
        self.base = self.n;
        n
    }

    pub fn total(&self) -> u64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_totals_and_deltas() {
        let m = Meter::new();
        assert_eq!(m.total(), 0);
        assert_eq!(m.delta(), 0);

        m.add(10);
        m.add(5);
        assert_eq!(m.total(), 15);
        assert_eq!(m.delta(), 15);
        assert_eq!(m.delta(), 0);

        m.add(3);
        assert_eq!(m.delta(), 3);
        assert_eq!(m.total(), 18);
    }

    #[test]
    fn reader_counts_bytes() {
        let mut rd = Reader::new(&b"hello world"[..]);
        let meter = rd.meter();

        let mut buf = [0u8; 6];
        rd.read_exact(&mut buf).unwrap();
        assert_eq!(meter.total(), 6);

        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).unwrap();
        assert_eq!(meter.total(), 11);
        assert_eq!(rest, b"world");
    }

    #[test]
    fn writer_counts_bytes() {
        let mut wr = Writer::new(Vec::new());
        let meter = wr.meter();

        wr.write_all(b"hello ").unwrap();
        assert_eq!(meter.delta(), 6);
        wr.write_all(b"world").unwrap();
        assert_eq!(meter.delta(), 5);
        assert_eq!(meter.total(), 11);
        assert_eq!(wr.into_inner(), b"hello world");
    }

    #[test]
    fn delta_tracks_monotonic_totals() {
        let mut d = Delta::default();
        d.set(100);
        assert_eq!(d.delta(), 100);
        d.set(100);
        assert_eq!(d.delta(), 0);
        d.set(250);
        assert_eq!(d.delta(), 150);
        assert_eq!(d.total(), 250);
    }
}
