/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Returns the human readable name of a digest pinned image reference, i.e. the last path
/// segment before the `@`. References without a digest have no name and yield `""`.
///
/// ```
/// assert_eq!(pullbench::image::extract_name("ghcr.io/org/repo@sha256:abcd"), "repo");
/// ```
pub fn extract_name(image: &str) -> &str {
    let Some(at) = image.find('@') else {
        return "";
    };
    let repo = &image[..at];
    match repo.rfind('/') {
        Some(slash) => &repo[slash + 1..],
        None => repo,
    }
}
