mod framework;
mod max_staleness;
mod selection;
