use crate::raw_event::{ChannelId, RawEvent, NUM_CELLS};

/// One observed amplitude of one cell at one applied voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    pub cell: usize,
    pub voltage: f64,
    pub amplitude: f64,
}

/// Mean response of a cell at one applied voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub voltage: f64,
    pub mean_amplitude: f64,
    pub samples: u32,
}

/// Calibration curve of one cell, ordered by ascending voltage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellSeries {
    pub cell: usize,
    pub points: Vec<SeriesPoint>,
}

impl CellSeries {
    pub fn voltages(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.voltage)
    }

    pub fn as_pairs(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.voltage, p.mean_amplitude))
            .collect()
    }
}

/// Calibration curves of every cell, indexed by cell.
pub type CellSeriesTable = Vec<CellSeries>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AggregateError {
    #[error("Event {trigger_tag} carries no data for channel {channel}")]
    MissingChannel { channel: ChannelId, trigger_tag: u32 },

    #[error("Applied voltage {0} is not finite")]
    NonFiniteVoltage(f64),

    #[error("Cell {0} is outside the capacitor array")]
    CellOutOfRange(usize),
}

#[derive(Debug)]
struct VoltageLevel {
    voltage: f64,
    sums: Vec<f64>,
    counts: Vec<u32>,
}

impl VoltageLevel {
    fn new(voltage: f64) -> Self {
        Self {
            voltage,
            sums: vec![0.0; NUM_CELLS],
            counts: vec![0; NUM_CELLS],
        }
    }
}

/// Accumulates sweep data of one channel into per-cell calibration curves.
///
/// Per-trigger amplitudes are folded into a running sum as they arrive; only
/// the mean per `(cell, voltage)` survives [`CalibrationAggregator::finish`].
#[derive(Debug)]
pub struct CalibrationAggregator {
    channel: ChannelId,
    levels: Vec<VoltageLevel>,
    events: usize,
}

impl CalibrationAggregator {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            levels: Vec::new(),
            events: 0,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn events_seen(&self) -> usize {
        self.events
    }

    /// Distinct voltages seen so far, in arrival order.
    pub fn voltages(&self) -> impl Iterator<Item = f64> + '_ {
        self.levels.iter().map(|l| l.voltage)
    }

    fn level_mut(&mut self, voltage: f64) -> Result<&mut VoltageLevel, AggregateError> {
        if !voltage.is_finite() {
            return Err(AggregateError::NonFiniteVoltage(voltage));
        }
        // Exact comparison: setpoints come from the same sweep plan.
        let position = match self
            .levels
            .iter()
            .position(|l| l.voltage.to_bits() == voltage.to_bits())
        {
            Some(position) => position,
            None => {
                log::debug!("New calibration level at {} V", voltage);
                self.levels.push(VoltageLevel::new(voltage));
                self.levels.len() - 1
            }
        };
        Ok(&mut self.levels[position])
    }

    pub fn push_point(&mut self, point: CalibrationPoint) -> Result<(), AggregateError> {
        if point.cell >= NUM_CELLS {
            return Err(AggregateError::CellOutOfRange(point.cell));
        }
        let level = self.level_mut(point.voltage)?;
        level.sums[point.cell] += point.amplitude;
        level.counts[point.cell] += 1;
        Ok(())
    }

    /// Fold every sample of the aggregated channel, realigned to its cell.
    pub fn push_event(&mut self, voltage: f64, event: &RawEvent) -> Result<(), AggregateError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("push_event"), 0));

        let samples = event
            .aligned_samples(self.channel)
            .ok_or(AggregateError::MissingChannel {
                channel: self.channel,
                trigger_tag: event.trigger_tag(),
            })?;

        let level = self.level_mut(voltage)?;
        for sample in samples {
            level.sums[sample.cell] += f64::from(sample.amplitude);
            level.counts[sample.cell] += 1;
        }
        self.events += 1;
        Ok(())
    }

    /// Reduce to one mean amplitude per `(cell, voltage)`.
    ///
    /// Levels a cell never saw are left out of that cell's series.
    pub fn finish(mut self) -> CellSeriesTable {
        self.levels
            .sort_by(|a, b| a.voltage.total_cmp(&b.voltage));

        (0..NUM_CELLS)
            .map(|cell| CellSeries {
                cell,
                points: self
                    .levels
                    .iter()
                    .filter(|level| level.counts[cell] > 0)
                    .map(|level| SeriesPoint {
                        voltage: level.voltage,
                        mean_amplitude: level.sums[cell] / f64::from(level.counts[cell]),
                        samples: level.counts[cell],
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn event(samples: Vec<f32>, first_cell: usize) -> RawEvent {
        RawEvent::single_channel(ch(1), samples, first_cell, 0).unwrap()
    }

    #[test]
    fn test_means_are_indexed_by_physical_cell() {
        let mut aggregator = CalibrationAggregator::new(ch(1));

        // Cell c reads 100 + c regardless of where it lands in the buffer.
        for first_cell in [0, 5, 1023] {
            let samples = (0..NUM_CELLS)
                .map(|p| 100.0 + ((p + first_cell) % NUM_CELLS) as f32)
                .collect();
            aggregator.push_event(0.2, &event(samples, first_cell)).unwrap();
        }

        let table = aggregator.finish();
        assert_eq!(table.len(), NUM_CELLS);
        for series in &table {
            assert_eq!(series.points.len(), 1);
            assert_eq!(series.points[0].samples, 3);
            assert_eq!(series.points[0].mean_amplitude, 100.0 + series.cell as f64);
        }
    }

    #[test]
    fn test_noise_is_averaged_per_voltage() {
        let mut aggregator = CalibrationAggregator::new(ch(1));
        aggregator.push_event(0.1, &event(vec![10.0; NUM_CELLS], 0)).unwrap();
        aggregator.push_event(0.1, &event(vec![14.0; NUM_CELLS], 0)).unwrap();
        aggregator.push_event(-0.1, &event(vec![2.0; NUM_CELLS], 0)).unwrap();

        let table = aggregator.finish();
        let pairs = table[512].as_pairs();
        assert_eq!(pairs, vec![(-0.1, 2.0), (0.1, 12.0)]);
    }

    #[test]
    fn test_missing_channel_is_reported() {
        let mut aggregator = CalibrationAggregator::new(ch(2));
        let err = aggregator
            .push_event(0.0, &event(vec![0.0; NUM_CELLS], 0))
            .unwrap_err();
        assert_eq!(
            err,
            AggregateError::MissingChannel { channel: ch(2), trigger_tag: 0 }
        );
        assert_eq!(aggregator.events_seen(), 0);
    }

    #[test]
    fn test_push_point_validates_input() {
        let mut aggregator = CalibrationAggregator::new(ch(0));
        assert_eq!(
            aggregator.push_point(CalibrationPoint { cell: NUM_CELLS, voltage: 0.0, amplitude: 1.0 }),
            Err(AggregateError::CellOutOfRange(NUM_CELLS))
        );
        assert!(aggregator
            .push_point(CalibrationPoint { cell: 0, voltage: f64::NAN, amplitude: 1.0 })
            .is_err());

        aggregator
            .push_point(CalibrationPoint { cell: 7, voltage: 0.3, amplitude: 5.0 })
            .unwrap();
        let table = aggregator.finish();
        assert_eq!(table[7].points.len(), 1);
        assert!(table[8].points.is_empty());
    }
}
