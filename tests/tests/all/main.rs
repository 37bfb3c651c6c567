mod load_balancing;
mod router;
