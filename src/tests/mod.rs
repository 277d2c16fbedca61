
mod test_distributed_throttle;
