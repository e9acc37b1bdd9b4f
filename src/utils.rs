//! Helper functions for the allocator. These are functions that don't
//! particularly belong to any concrete module of the program.

/// Rounds `value` up to the next multiple of `unit`.
///
/// `unit` must be a power of two. This is used to keep every block size a
/// multiple of [`crate::block::DSIZE`] and to round arena growth to the
/// platform page size.
pub(crate) fn round_up(value: usize, unit: usize) -> usize {
    debug_assert!(unit.is_power_of_two());
    (value + unit - 1) & !(unit - 1)
}
