mod framework;
mod rs;
mod sharded;
mod single;
