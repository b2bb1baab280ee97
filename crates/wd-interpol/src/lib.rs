//! Time-series interpolation for irregularly sampled sensor data.
//!
//! Takes a sorted slice of raw points and produces evenly spaced output
//! slots from `start` to `end` in `step`-sized intervals, each carrying the
//! average, minimum and maximum over that slot.  Two input flavors are
//! supported: [`Kind::Absolute`] for gauge-style readings and [`Kind::Rate`]
//! for monotonically increasing counters whose derivative is the reading.
//!
//! The unit of the timestamps does not matter (seconds or milliseconds since
//! the epoch both work); only differences are used.  Slots that no raw pair
//! covers come back as NaN, and raw pairs further than `max_fill` apart are
//! never interpolated across.

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A raw input sample.  `value` is either the absolute reading at `asof` or
/// the cumulative counter value, depending on [`Kind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub asof: i64,
    pub value: f64,
}

/// Whether raw values are gauge readings or cumulative counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Absolute,
    Rate,
}

/// One interpolated output slot covering the half-open interval
/// `[asof, asof + step)`.
#[derive(Debug, Clone, Copy)]
pub struct IntPoint {
    pub asof: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Refuse to produce absurdly large result series.
pub const MAX_POINTS: usize = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum InterpolError {
    #[error("end {end} <= start {start}")]
    EmptyRange { start: i64, end: i64 },
    #[error("step {0} < 2")]
    StepTooSmall(i64),
    #[error("max_fill {max_fill} < step {step}")]
    MaxFillTooSmall { max_fill: i64, step: i64 },
    #[error("raw input is not sorted by time")]
    Unsorted,
    #[error("would produce {0} points (limit {MAX_POINTS})")]
    TooManyPoints(usize),
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Interpolate `raw` into evenly spaced slots from `start` to `end`.
///
/// If `step` does not divide `end - start` evenly the end is pushed out, so
/// the result always holds `ceil((end - start) / step)` points with
/// `asof = start + i * step`.  The input must be sorted by time.  Ideally it
/// includes one point at or before `start` and one past `end` so the
/// boundary slots can be interpolated; missing context simply yields NaN
/// edges.  `max_fill` bounds the largest raw gap that may be interpolated
/// across and must be at least `step`.
pub fn interpolate(
    raw: &[RawPoint],
    kind: Kind,
    start: i64,
    end: i64,
    step: i64,
    max_fill: i64,
) -> Result<Vec<IntPoint>, InterpolError> {
    if step < 2 {
        // step/2 must remain meaningful
        return Err(InterpolError::StepTooSmall(step));
    }
    if max_fill < step {
        return Err(InterpolError::MaxFillTooSmall { max_fill, step });
    }
    if raw.windows(2).any(|w| w[0].asof > w[1].asof) {
        return Err(InterpolError::Unsorted);
    }

    let (count, end) = adjust_end(start, end, step)?;

    // Trim raw points that cannot contribute to any slot.
    let raw = rtrim(ltrim(raw, start), end, step);

    if raw.is_empty() {
        return Ok(nan_series(start, step, count));
    }

    let mut res = Vec::with_capacity(count);
    // `i` indexes the last raw point strictly before the current slot; -1
    // while the slot begins before all raw data.
    let mut i: isize = -1;
    let len = raw.len() as isize;

    for r in 0..count {
        let ts = start + r as i64 * step; // slot start
        let te = ts + step; // slot end

        while i + 1 < len && raw[(i + 1) as usize].asof < ts {
            i += 1;
        }
        // `j` is the last raw point at or before te; the pairs (i..=j, +1)
        // are exactly the ones whose segments overlap this slot.
        let mut j = i;
        while j + 1 < len && raw[(j + 1) as usize].asof <= te {
            j += 1;
        }

        let mut num = 0.0; // integral under the piece-wise linear curve
        let mut denom = 0.0; // time covered; the slot value is num/denom
        let mut min = f64::NAN;
        let mut max = f64::NAN;

        for x in i..=j {
            if x < 0 {
                continue;
            }
            let x = x as usize;
            let tx = raw[x].asof;
            let vx = raw[x].value;
            if kind == Kind::Absolute && tx >= ts && tx <= te {
                fold_minmax(&mut min, &mut max, vx);
            }
            if x + 1 >= raw.len() {
                continue;
            }
            let tx1 = raw[x + 1].asof;
            let vx1 = raw[x + 1].value;

            // instantaneous rate across the pair, needed for rate min/max
            let mut raw_rate = 0.0;
            if kind == Kind::Rate && tx1 > tx {
                raw_rate = (vx1 - vx) / (tx1 - tx) as f64;
                if raw_rate < 0.0 {
                    // negative delta = counter reset, rate unknown
                    raw_rate = f64::NAN;
                }
            }

            if tx1 == ts || tx == te || tx == tx1 {
                // pair touches the slot only at a boundary, or has zero
                // width; nothing to interpolate
            } else if tx >= ts && tx1 <= te {
                // both points inside the slot
                let dx = (tx1 - tx) as f64;
                match kind {
                    Kind::Absolute => {
                        denom += dx;
                        num += dx * (vx1 + vx) / 2.0;
                    }
                    Kind::Rate => {
                        if vx1 >= vx {
                            denom += dx;
                            num += vx1 - vx;
                            fold_minmax(&mut min, &mut max, raw_rate);
                        }
                    }
                }
            } else if tx1 - tx > max_fill {
                // too far apart to interpolate across
            } else if tx < ts && tx1 <= te {
                // pair enters the slot from the left
                let dx = (tx1 - ts) as f64;
                let ratio = (ts - tx) as f64 / (tx1 - tx) as f64;
                let iy = vx + ratio * (vx1 - vx);
                match kind {
                    Kind::Absolute => {
                        denom += dx;
                        num += dx * (vx1 + iy) / 2.0;
                        fold_minmax(&mut min, &mut max, iy);
                    }
                    Kind::Rate => {
                        if vx1 >= iy {
                            denom += dx;
                            num += vx1 - iy;
                            fold_minmax(&mut min, &mut max, raw_rate);
                        }
                    }
                }
            } else if tx >= ts && tx1 > te {
                // pair leaves the slot to the right
                let dx = (te - tx) as f64;
                let ratio = dx / (tx1 - tx) as f64;
                let iy = vx + ratio * (vx1 - vx);
                match kind {
                    Kind::Absolute => {
                        denom += dx;
                        num += dx * (vx + iy) / 2.0;
                        fold_minmax(&mut min, &mut max, iy);
                    }
                    Kind::Rate => {
                        if iy >= vx {
                            denom += dx;
                            num += iy - vx;
                            fold_minmax(&mut min, &mut max, raw_rate);
                        }
                    }
                }
            } else {
                // tx < ts && tx1 > te: the pair spans the whole slot
                match kind {
                    Kind::Absolute => {
                        let dx = (te - ts) as f64;
                        let ratio1 = (ts - tx) as f64 / (tx1 - tx) as f64;
                        let ratio2 = (te - tx) as f64 / (tx1 - tx) as f64;
                        let iy1 = vx + ratio1 * (vx1 - vx);
                        let iy2 = vx + ratio2 * (vx1 - vx);
                        denom += dx;
                        num += dx * (iy1 + iy2) / 2.0;
                        fold_minmax(&mut min, &mut max, iy1);
                        fold_minmax(&mut min, &mut max, iy2);
                    }
                    Kind::Rate => {
                        if vx1 >= vx {
                            denom = (tx1 - tx) as f64;
                            num = vx1 - vx;
                            fold_minmax(&mut min, &mut max, raw_rate);
                        }
                    }
                }
            }
        }

        if denom > 0.0 {
            res.push(IntPoint { asof: ts, avg: num / denom, min, max });
        } else if kind == Kind::Absolute
            && ((i + 1) as usize) < raw.len()
            && raw[(i + 1) as usize].asof >= ts
            && raw[(i + 1) as usize].asof < te
        {
            // a single data point inside the slot with no neighbor to
            // interpolate with: use it verbatim
            let v = raw[(i + 1) as usize].value;
            res.push(IntPoint { asof: ts, avg: v, min: v, max: v });
        } else {
            let nan = f64::NAN;
            res.push(IntPoint { asof: ts, avg: nan, min: nan, max: nan });
        }
    }

    Ok(res)
}

fn fold_minmax(min: &mut f64, max: &mut f64, v: f64) {
    if min.is_nan() || v < *min {
        *min = v;
    }
    if max.is_nan() || v > *max {
        *max = v;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute the slot count and push `end` out to a multiple of `step`.
fn adjust_end(start: i64, end: i64, step: i64) -> Result<(usize, i64), InterpolError> {
    if end <= start {
        return Err(InterpolError::EmptyRange { start, end });
    }
    let count = usize::try_from((end - start + step - 1) / step)
        .map_err(|_| InterpolError::TooManyPoints(usize::MAX))?;
    if count > MAX_POINTS {
        return Err(InterpolError::TooManyPoints(count));
    }
    Ok((count, start + count as i64 * step))
}

/// Drop leading points: keep from the last raw point at or before `start`,
/// or from the first point if none qualifies.
fn ltrim(raw: &[RawPoint], start: i64) -> &[RawPoint] {
    let mut first = 0;
    for (idx, p) in raw.iter().enumerate() {
        if p.asof <= start {
            first = idx;
        } else {
            break;
        }
    }
    &raw[first..]
}

/// Drop trailing points: keep through the first raw point at or past
/// `end + step` (with `end` already snapped), or everything if none.
fn rtrim(raw: &[RawPoint], end: i64, step: i64) -> &[RawPoint] {
    for (idx, p) in raw.iter().enumerate() {
        if p.asof >= end + step {
            return &raw[..=idx];
        }
    }
    raw
}

fn nan_series(start: i64, step: i64, count: usize) -> Vec<IntPoint> {
    let nan = f64::NAN;
    (0..count)
        .map(|i| IntPoint { asof: start + i as i64 * step, avg: nan, min: nan, max: nan })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
