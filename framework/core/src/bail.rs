/// Return this error from a workload unit's driver to indicate that the unit is bailing.
///
/// This should be used when a unit encounters an error that is not fatal to that unit but not
/// necessarily to the run. For example, if the backend refuses one apply operation then the unit
/// may bail but the run should continue with the other units.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct UnitBailError {
    msg: String,
}

impl Default for UnitBailError {
    fn default() -> Self {
        Self {
            msg: "Workload unit is bailing".to_string(),
        }
    }
}
