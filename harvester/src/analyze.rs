use anyhow::Context;
use polars::prelude::*;

use crate::backend::MetricSeries;
use crate::frame::{stacked_frame, FrameError};
use crate::registry::Aggregate;

/// Reduce a metric's series to a single value according to its declared aggregate.
///
/// Returns `Ok(None)` when the query matched nothing, which is a normal outcome for metrics
/// whose exporter is absent from the cluster. [Aggregate::Last] takes the mean of the values
/// carried by the latest timestamp, since several series can share it.
pub(crate) fn aggregate_value(
    series: &[MetricSeries],
    aggregate: Aggregate,
) -> anyhow::Result<Option<f64>> {
    let frame = match stacked_frame(series) {
        Ok(frame) => frame,
        Err(e) => {
            return match e.downcast_ref::<FrameError>() {
                Some(FrameError::EmptyFrame) => Ok(None),
                None => Err(e),
            };
        }
    };

    let value = match aggregate {
        Aggregate::Mean => frame
            .column("value")?
            .as_materialized_series()
            .mean()
            .context("Mean")?,
        Aggregate::Max => frame
            .column("value")?
            .as_materialized_series()
            .max::<f64>()
            .context("Max")?
            .context("Missing max")?,
        Aggregate::Last => frame
            .clone()
            .lazy()
            .filter(col("time").eq(col("time").max()))
            .collect()?
            .column("value")?
            .as_materialized_series()
            .mean()
            .context("Last")?,
    };

    Ok(Some(value))
}
