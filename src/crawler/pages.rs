use crate::crawler::task::Job;

/// Pages needed to read `count` items at `size` per page
pub fn page_count(count: u32, size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    count.div_ceil(size)
}

/// Items expected on `page`; only the last page may be short
pub fn expected_on_page(count: u32, size: u32, page: u32) -> u32 {
    let pages = page_count(count, size);
    if page == 0 || page > pages {
        0
    } else if page == pages {
        count - size * (pages - 1)
    } else {
        size
    }
}

/// Jobs for pages 2..=N of every leaf. Page 1 of each leaf is the leaf itself.
pub fn expand(leaves: &[Job]) -> Vec<Job> {
    leaves
        .iter()
        .filter_map(|leaf| leaf.reported_count().map(|count| (leaf, count)))
        .flat_map(|(leaf, count)| {
            (2..=page_count(count, leaf.size))
                .map(move |page| leaf.page_of(page, expected_on_page(count, leaf.size, page)))
        })
        .collect()
}
