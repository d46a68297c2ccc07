pub mod extract;
mod fetcher;

pub use fetcher::SiteFetcher;
