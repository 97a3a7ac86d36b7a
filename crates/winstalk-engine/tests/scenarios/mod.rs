mod breakpoints;
mod hooks;
mod sift;
mod watches;
