/// Splits the first `prefix` elements off the front of `data` and returns
/// them, leaving `data` pointing at the rest. Panics when `data` is too
/// short, which for output-buffer carving means layout broke its sizing
/// contract.
#[track_caller]
pub(crate) fn take_prefix_mut<'t, T>(data: &mut &'t mut [T], prefix: usize) -> &'t mut [T] {
    data.split_off_mut(..prefix).unwrap_or_else(|| {
        panic!(
            "Attempted to split off {prefix} elements when only {len} are available",
            len = data.len()
        )
    })
}

pub(crate) fn try_take_prefix_mut<'t, T>(
    data: &mut &'t mut [T],
    prefix: usize,
) -> Option<&'t mut [T]> {
    data.split_off_mut(..prefix)
}
