pub mod directcsi;
