use polars::prelude::*;
use thiserror::Error;

use crate::backend::MetricSeries;

#[derive(Error, Debug)]
pub(crate) enum FrameError {
    #[error("No points in any series")]
    EmptyFrame,
}

/// Stack every point of every series into a two column frame of `time` and `value`.
///
/// Series identity is deliberately dropped. Features summarise a whole category metric, not
/// individual pods or nodes, so all samples contribute to one reduction.
pub(crate) fn stacked_frame(series: &[MetricSeries]) -> anyhow::Result<DataFrame> {
    let mut times = Vec::new();
    let mut values = Vec::new();
    for series in series {
        for (time, value) in &series.points {
            times.push(*time);
            values.push(*value);
        }
    }

    if times.is_empty() {
        return Err(FrameError::EmptyFrame.into());
    }

    let frame = DataFrame::new(vec![
        Column::new("time".into(), times),
        Column::new("value".into(), values),
    ])?;

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn stacks_points_across_series() {
        let series = vec![
            MetricSeries {
                labels: BTreeMap::new(),
                points: vec![(1.0, 10.0), (2.0, 20.0)],
            },
            MetricSeries {
                labels: BTreeMap::new(),
                points: vec![(1.0, 30.0)],
            },
        ];

        let frame = stacked_frame(&series).unwrap();
        assert_eq!(frame.height(), 3);
        assert_eq!(frame.get_column_names(), &["time", "value"]);
    }

    #[test]
    fn no_points_is_an_empty_frame_error() {
        let series = vec![MetricSeries {
            labels: BTreeMap::new(),
            points: vec![],
        }];

        let error = stacked_frame(&series).unwrap_err();
        assert!(error.downcast_ref::<FrameError>().is_some());
    }
}
