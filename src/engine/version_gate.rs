/// The one place that decides whether a published database replaces the local one.
///
/// Only a strictly newer remote generation wins; equal or older versions are
/// left alone so a sync can never downgrade the store.
pub fn should_replace_database(remote_version: i64, local_version: i64) -> bool {
    remote_version > local_version
}
