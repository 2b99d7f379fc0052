use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

/// A fixed-capacity uniform sample over a stream of unknown length
/// (Algorithm R). Bounds the memory the metrics engine spends on segment
/// sizes without losing the shape of the distribution.
pub struct Reservoir {
    cap: usize,
    seen: u64,
    samples: Vec<f64>,
}

impl Reservoir {
    pub fn new(cap: usize) -> Reservoir {
        Reservoir {
            cap,
            seen: 0,
            samples: Vec::with_capacity(cap),
        }
    }

    pub fn sample(&mut self, v: f64) {
        self.seen += 1;
        if self.samples.len() < self.cap {
            self.samples.push(v);
            return;
        }
        let j = rand::thread_rng().gen_range(0..self.seen);
        if (j as usize) < self.cap {
            self.samples[j as usize] = v;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn reset(&mut self) {
        self.seen = 0;
        self.samples.clear();
    }

    pub fn minimum(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NAN, f64::min)
    }

    pub fn maximum(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NAN, f64::max)
    }

    pub fn median(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    pub fn stdev(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / n;
        let variance = self
            .samples
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        variance.sqrt()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Operations {
    pub upload: u64,
    pub download: u64,
    pub expunge: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Canceled {
    pub upload: u64,
    pub download: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SegmentBytes {
    pub minimum: u64,
    pub maximum: u64,
    pub median: f64,
    pub sigma: f64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Segments {
    pub total: u64,
    pub bytes: SegmentBytes,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Flow {
    pub r#in: u64,
    pub out: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Transfer {
    pub front: Flow,
    pub back: Flow,
}

/// A point-in-time copy of one bucket's counters, in the exact shape the
/// `/metrics` endpoint emits.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Snapshot {
    pub operations: Operations,
    pub canceled: Canceled,
    pub segments: Segments,
    pub transfer: Transfer,
}

struct Inner {
    operations: Operations,
    canceled: Canceled,
    transfer: Transfer,
    segments: Reservoir,
}

/// Per-bucket metrics. Front counters are plaintext bytes exchanged with
/// agents; back counters are wire bytes exchanged with the backend.
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new(reservoir_size: usize) -> Metrics {
        Metrics {
            inner: Mutex::new(Inner {
                operations: Operations::default(),
                canceled: Canceled::default(),
                transfer: Transfer::default(),
                segments: Reservoir::new(reservoir_size),
            }),
        }
    }

    pub fn start_upload(&self) {
        self.inner.lock().operations.upload += 1;
    }

    pub fn start_download(&self) {
        self.inner.lock().operations.download += 1;
    }

    pub fn expunge(&self) {
        self.inner.lock().operations.expunge += 1;
    }

    pub fn cancel_upload(&self) {
        self.inner.lock().canceled.upload += 1;
    }

    pub fn cancel_download(&self) {
        self.inner.lock().canceled.download += 1;
    }

    pub fn segment(&self, size: usize) {
        self.inner.lock().segments.sample(size as f64);
    }

    pub fn in_front(&self, bytes: u64) {
        self.inner.lock().transfer.front.r#in += bytes;
    }

    pub fn out_front(&self, bytes: u64) {
        self.inner.lock().transfer.front.out += bytes;
    }

    pub fn in_back(&self, bytes: u64) {
        self.inner.lock().transfer.back.r#in += bytes;
    }

    pub fn out_back(&self, bytes: u64) {
        self.inner.lock().transfer.back.out += bytes;
    }

    /// Recomputes the segment statistics and returns the current counters.
    /// NaN statistics from an empty reservoir are reported as zero.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();

        let zero_if_nan = |v: f64| if v.is_nan() { 0.0 } else { v };
        Snapshot {
            operations: inner.operations,
            canceled: inner.canceled,
            transfer: inner.transfer,
            segments: Segments {
                total: inner.segments.seen(),
                bytes: SegmentBytes {
                    minimum: zero_if_nan(inner.segments.minimum()) as u64,
                    maximum: zero_if_nan(inner.segments.maximum()) as u64,
                    median: zero_if_nan(inner.segments.median()),
                    sigma: zero_if_nan(inner.segments.stdev()),
                },
            },
        }
    }

    /// Zeroes all counters and clears the reservoir.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.operations = Operations::default();
        inner.canceled = Canceled::default();
        inner.transfer = Transfer::default();
        inner.segments.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_is_bounded_and_counts_everything() {
        let mut r = Reservoir::new(10);
        for i in 0..1000 {
            r.sample(i as f64);
        }
        assert_eq!(r.seen(), 1000);
        assert_eq!(r.samples.len(), 10);
    }

    #[test]
    fn reservoir_statistics_on_known_values() {
        let mut r = Reservoir::new(100);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            r.sample(v);
        }
        assert_eq!(r.minimum(), 2.0);
        assert_eq!(r.maximum(), 9.0);
        assert_eq!(r.median(), 4.5);
        assert!((r.stdev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_reservoir_snapshots_as_zero() {
        let m = Metrics::new(100);
        let s = m.snapshot();
        assert_eq!(s.segments.total, 0);
        assert_eq!(s.segments.bytes.minimum, 0);
        assert_eq!(s.segments.bytes.maximum, 0);
        assert_eq!(s.segments.bytes.median, 0.0);
        assert_eq!(s.segments.bytes.sigma, 0.0);
    }

    #[test]
    fn counters_accumulate_and_reset() {
        let m = Metrics::new(100);
        m.start_upload();
        m.start_upload();
        m.start_download();
        m.expunge();
        m.cancel_upload();
        m.cancel_download();
        m.segment(512);
        m.segment(1024);
        m.in_front(100);
        m.out_front(25);
        m.in_back(75);
        m.out_back(50);

        let s = m.snapshot();
        assert_eq!(s.operations.upload, 2);
        assert_eq!(s.operations.download, 1);
        assert_eq!(s.operations.expunge, 1);
        assert_eq!(s.canceled.upload, 1);
        assert_eq!(s.canceled.download, 1);
        assert_eq!(s.segments.total, 2);
        assert_eq!(s.segments.bytes.minimum, 512);
        assert_eq!(s.segments.bytes.maximum, 1024);
        assert_eq!(s.transfer.front.r#in, 100);
        assert_eq!(s.transfer.front.out, 25);
        assert_eq!(s.transfer.back.r#in, 75);
        assert_eq!(s.transfer.back.out, 50);

        m.reset();
        let s = m.snapshot();
        assert_eq!(s.operations.upload, 0);
        assert_eq!(s.segments.total, 0);
        assert_eq!(s.transfer.front.r#in, 0);
    }

    #[test]
    fn snapshot_serializes_in_the_wire_shape() {
        let m = Metrics::new(100);
        m.start_upload();
        m.segment(64);

        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["operations"]["upload"], 1);
        assert_eq!(json["canceled"]["download"], 0);
        assert_eq!(json["segments"]["total"], 1);
        assert_eq!(json["segments"]["bytes"]["minimum"], 64);
        assert!(json["transfer"]["front"].get("in").is_some());
        assert!(json["transfer"]["back"].get("out").is_some());
    }
}
