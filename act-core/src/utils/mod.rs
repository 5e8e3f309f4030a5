pub(crate) mod debug;
